// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Benchmark-driven choice between the reference and generated kernels.
//!
//! Candidates run one at a time. Each gets `warmup` untimed launches and
//! `repeats` timed ones; its score is the median. The lowest score wins and
//! ties keep the earlier candidate. A failing generated kernel is dropped from
//! the round, a failing reference aborts it.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use spiral_config::TuningConfig;
use tracing::{debug, warn};

use crate::error::{Result, SgmmError};
use crate::problem::OutputLayout;
use crate::scratch::RoundScratch;
use crate::tensor::HostTensor;

/// Tensors shared by every candidate of a round.
#[derive(Clone, Debug)]
pub struct GroupedMmInputs {
    pub mat_a: HostTensor,
    /// Logical `[.., K, N]`, stored with K contiguous.
    pub mat_b: HostTensor,
    pub scale_a: HostTensor,
    pub scale_b: HostTensor,
    pub offsets: Option<Vec<i32>>,
    pub bias: Option<HostTensor>,
    pub use_fast_accum: bool,
}

/// One implementation competing in a round.
pub trait Choice: Send + Sync {
    fn name(&self) -> &str;

    fn is_reference(&self) -> bool {
        false
    }

    fn run(&self, inputs: &GroupedMmInputs, scratch: &mut RoundScratch<'_>) -> Result<HostTensor>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BenchmarkSettings {
    pub warmup: u32,
    pub repeats: u32,
    pub budget: Option<Duration>,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self::from(&TuningConfig::default())
    }
}

impl From<&TuningConfig> for BenchmarkSettings {
    fn from(config: &TuningConfig) -> Self {
        Self {
            warmup: config.warmup,
            repeats: config.repeats.max(1),
            budget: config.budget,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    Timed,
    /// Ran without timing because it was the only candidate.
    Untimed,
    Failed(String),
    /// Not started because the round budget ran out.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingRow {
    pub name: String,
    pub median: Option<Duration>,
    pub samples: usize,
    pub status: CandidateStatus,
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub winner: String,
    pub timings: Vec<TimingRow>,
    pub output: HostTensor,
}

impl Selection {
    pub fn timing(&self, name: &str) -> Option<&TimingRow> {
        self.timings.iter().find(|row| row.name == name)
    }
}

/// Median of `samples`; the mean of the two middle samples for even counts.
pub fn median(samples: &mut [Duration]) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 1 {
        Some(samples[mid])
    } else {
        Some((samples[mid - 1] + samples[mid]) / 2)
    }
}

fn run_checked(
    choice: &dyn Choice,
    inputs: &GroupedMmInputs,
    layout: &OutputLayout,
    scratch: &mut RoundScratch<'_>,
) -> Result<HostTensor> {
    let out = choice.run(inputs, scratch)?;
    if out.sizes() != layout.sizes.as_slice() {
        return Err(SgmmError::OutputShape {
            name: choice.name().to_string(),
            expected: layout.sizes.clone(),
            got: out.sizes().to_vec(),
        });
    }
    Ok(out)
}

fn benchmark(
    choice: &dyn Choice,
    inputs: &GroupedMmInputs,
    layout: &OutputLayout,
    settings: &BenchmarkSettings,
    scratch: &mut RoundScratch<'_>,
) -> Result<(Duration, usize, HostTensor)> {
    for _ in 0..settings.warmup {
        run_checked(choice, inputs, layout, scratch)?;
    }
    let mut samples = Vec::with_capacity(settings.repeats as usize);
    let mut last = None;
    for _ in 0..settings.repeats.max(1) {
        let started = Instant::now();
        let out = run_checked(choice, inputs, layout, scratch)?;
        samples.push(started.elapsed());
        last = Some(out);
    }
    let count = samples.len();
    match (median(&mut samples), last) {
        (Some(score), Some(out)) => Ok((score, count, out)),
        _ => Err(SgmmError::launch(format!("{} produced no timed run", choice.name()))),
    }
}

/// Picks the fastest candidate for `name` and returns its output.
pub fn autotune_select(
    name: &str,
    choices: &[Box<dyn Choice>],
    inputs: &GroupedMmInputs,
    layout: &OutputLayout,
    settings: &BenchmarkSettings,
    scratch: &mut RoundScratch<'_>,
) -> Result<Selection> {
    if choices.is_empty() {
        return Err(SgmmError::NoCandidates {
            name: name.to_string(),
        });
    }

    if let [only] = choices {
        let output = run_checked(only.as_ref(), inputs, layout, scratch)?;
        debug!(op = name, choice = only.name(), "single candidate, skipping benchmark");
        return Ok(Selection {
            winner: only.name().to_string(),
            timings: vec![TimingRow {
                name: only.name().to_string(),
                median: None,
                samples: 1,
                status: CandidateStatus::Untimed,
            }],
            output,
        });
    }

    let round_started = Instant::now();
    let mut timings = Vec::with_capacity(choices.len());
    let mut best: Option<(usize, Duration, HostTensor)> = None;

    for (index, choice) in choices.iter().enumerate() {
        let over_budget = settings
            .budget
            .map_or(false, |budget| round_started.elapsed() >= budget);
        // The first candidate always runs so the round has a result.
        if over_budget && best.is_some() {
            debug!(op = name, choice = choice.name(), "round budget exhausted, skipping");
            timings.push(TimingRow {
                name: choice.name().to_string(),
                median: None,
                samples: 0,
                status: CandidateStatus::Skipped,
            });
            continue;
        }

        match benchmark(choice.as_ref(), inputs, layout, settings, scratch) {
            Ok((score, samples, output)) => {
                debug!(op = name, choice = choice.name(), ?score, samples, "benchmarked candidate");
                timings.push(TimingRow {
                    name: choice.name().to_string(),
                    median: Some(score),
                    samples,
                    status: CandidateStatus::Timed,
                });
                let better = best.as_ref().map_or(true, |(_, current, _)| score < *current);
                if better {
                    best = Some((index, score, output));
                }
            }
            Err(err) if choice.is_reference() => return Err(err),
            Err(err) => {
                warn!(op = name, choice = choice.name(), error = %err, "candidate failed, excluding it");
                timings.push(TimingRow {
                    name: choice.name().to_string(),
                    median: None,
                    samples: 0,
                    status: CandidateStatus::Failed(err.to_string()),
                });
            }
        }
    }

    let (index, score, output) = best.ok_or_else(|| SgmmError::NoCandidates {
        name: name.to_string(),
    })?;
    let winner = choices[index].name().to_string();
    debug!(op = name, winner = %winner, ?score, "autotune round finished");
    Ok(Selection {
        winner,
        timings,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scratch::HostScratchAllocator;
    use crate::tensor::DType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        reference: bool,
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, delay_ms: u64) -> Self {
            Self {
                name,
                reference: false,
                delay: Duration::from_millis(delay_ms),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Choice for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn is_reference(&self) -> bool {
            self.reference
        }

        fn run(&self, _inputs: &GroupedMmInputs, _scratch: &mut RoundScratch<'_>) -> Result<HostTensor> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(SgmmError::launch("boom"));
            }
            std::thread::sleep(self.delay);
            Ok(HostTensor::zeros(DType::F32, &[2, 2]))
        }
    }

    fn inputs() -> GroupedMmInputs {
        let t = HostTensor::zeros(DType::F32, &[1, 2, 2]);
        GroupedMmInputs {
            mat_a: t.clone(),
            mat_b: t.clone(),
            scale_a: t.clone(),
            scale_b: t,
            offsets: None,
            bias: None,
            use_fast_accum: false,
        }
    }

    fn layout() -> OutputLayout {
        OutputLayout {
            dtype: DType::F32,
            sizes: vec![2, 2],
        }
    }

    fn settings() -> BenchmarkSettings {
        BenchmarkSettings {
            warmup: 1,
            repeats: 3,
            budget: None,
        }
    }

    #[test]
    fn median_handles_odd_and_even_counts() {
        let ms = Duration::from_millis;
        assert_eq!(median(&mut [ms(3), ms(1), ms(2)]), Some(ms(2)));
        assert_eq!(median(&mut [ms(4), ms(1), ms(2), ms(3)]), Some(Duration::from_micros(2500)));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn fastest_candidate_wins_and_failures_are_isolated() {
        let mut reference = Fixed::new("reference", 6);
        reference.reference = true;
        let mut broken = Fixed::new("broken", 0);
        broken.fail = true;
        let choices: Vec<Box<dyn Choice>> = vec![
            Box::new(reference),
            Box::new(broken),
            Box::new(Fixed::new("fast", 0)),
        ];
        let allocator = HostScratchAllocator::new();
        let mut scratch = RoundScratch::new(&allocator, None);
        let selection =
            autotune_select("op", &choices, &inputs(), &layout(), &settings(), &mut scratch).unwrap();
        assert_eq!(selection.winner, "fast");
        assert!(matches!(
            selection.timing("broken").unwrap().status,
            CandidateStatus::Failed(_)
        ));
        assert_eq!(selection.timing("reference").unwrap().samples, 3);
    }

    #[test]
    fn reference_failure_is_fatal() {
        let mut reference = Fixed::new("reference", 0);
        reference.reference = true;
        reference.fail = true;
        let choices: Vec<Box<dyn Choice>> = vec![Box::new(reference), Box::new(Fixed::new("gen", 0))];
        let allocator = HostScratchAllocator::new();
        let mut scratch = RoundScratch::new(&allocator, None);
        assert!(matches!(
            autotune_select("op", &choices, &inputs(), &layout(), &settings(), &mut scratch),
            Err(SgmmError::Launch(_))
        ));
    }

    #[test]
    fn single_candidate_runs_once_without_timing() {
        let only = Fixed::new("reference", 0);
        let choices: Vec<Box<dyn Choice>> = vec![Box::new(only)];
        let allocator = HostScratchAllocator::new();
        let mut scratch = RoundScratch::new(&allocator, None);
        let selection =
            autotune_select("op", &choices, &inputs(), &layout(), &settings(), &mut scratch).unwrap();
        assert_eq!(selection.timings[0].status, CandidateStatus::Untimed);
        assert_eq!(selection.winner, "reference");
    }

    #[test]
    fn exhausted_budget_skips_later_candidates() {
        let choices: Vec<Box<dyn Choice>> = vec![
            Box::new(Fixed::new("first", 5)),
            Box::new(Fixed::new("second", 0)),
        ];
        let allocator = HostScratchAllocator::new();
        let mut scratch = RoundScratch::new(&allocator, None);
        let budget = BenchmarkSettings {
            budget: Some(Duration::from_millis(1)),
            ..settings()
        };
        let selection =
            autotune_select("op", &choices, &inputs(), &layout(), &budget, &mut scratch).unwrap();
        assert_eq!(selection.winner, "first");
        assert_eq!(selection.timing("second").unwrap().status, CandidateStatus::Skipped);
    }

    #[test]
    fn wrong_output_shape_counts_as_failure() {
        let wrong = OutputLayout {
            dtype: DType::F32,
            sizes: vec![3, 3],
        };
        let choices: Vec<Box<dyn Choice>> = vec![Box::new(Fixed::new("a", 0)), Box::new(Fixed::new("b", 0))];
        let allocator = HostScratchAllocator::new();
        let mut scratch = RoundScratch::new(&allocator, None);
        assert!(matches!(
            autotune_select("op", &choices, &inputs(), &wrong, &settings(), &mut scratch),
            Err(SgmmError::NoCandidates { .. })
        ));
    }
}
