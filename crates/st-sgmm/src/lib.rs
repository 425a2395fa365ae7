// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Autotuned scaled grouped GEMM.
//!
//! The pipeline: describe the problem ([`problem`]), enumerate kernel
//! configurations ([`config_space`]), drop the infeasible ones ([`prune`]),
//! render and run one persistent kernel per survivor ([`codegen`], [`kernel`],
//! [`schedule`], [`epilogue`]) and keep the fastest against the reference
//! ([`autotune`], [`reference`]). [`lowering::tuned_scaled_grouped_mm`] ties
//! it together.

pub mod autotune;
pub mod codegen;
pub mod config_space;
pub mod device;
pub mod eligibility;
pub mod epilogue;
pub mod error;
pub mod kernel;
pub mod lowering;
pub mod problem;
pub mod prune;
pub mod reference;
pub mod schedule;
pub mod scratch;
pub mod telemetry;
pub mod tensor;

pub use autotune::{autotune_select, BenchmarkSettings, Choice, GroupedMmInputs, Selection};
pub use config_space::{generate_configs, HardwareFamily, KernelConfig};
pub use device::{DeviceProfile, DeviceQuery, StaticDevice};
pub use eligibility::can_use_generated_kernel;
pub use error::{Result, SgmmError};
pub use lowering::{scaled_grouped_mm, tuned_scaled_grouped_mm, ScaledGroupedMmRequest};
pub use problem::{OutputLayout, ProblemShape, ShapeClass};
pub use prune::{prune, prune_with_reasons, HardwareLimits, PruneReason};
pub use schedule::{simulate_all_contexts, ContextTiles, GroupOffsets, GroupTilePlan, WorkTile};
pub use scratch::{HostScratchAllocator, RoundScratch, ScratchAllocator};
pub use tensor::{DType, HostTensor};
