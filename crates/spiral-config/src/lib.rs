//! Shared runtime configuration for the grouped GEMM tuner.
//!
//! * [`tracing`] installs the global subscriber (fmt + optional Chrome trace).
//! * [`tuning`] reads the autotuning knobs from the environment once per process.

pub mod tracing;
pub mod tuning;

pub use tuning::{FamilyOverride, TuningConfig, TuningEnvError};
