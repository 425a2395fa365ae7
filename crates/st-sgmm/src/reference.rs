// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Library reference for scaled grouped GEMM: straightforward per-group loops
//! over logical indices. It is always a valid choice and the baseline the
//! generated kernels race against.

use crate::autotune::{Choice, GroupedMmInputs};
use crate::error::{Result, SgmmError};
use crate::problem::{OutputLayout, ProblemShape, ShapeClass};
use crate::schedule::GroupOffsets;
use crate::scratch::RoundScratch;
use crate::tensor::HostTensor;

pub const REFERENCE_NAME: &str = "reference::scaled_grouped_mm";

/// Computes `out = (A_g @ B_g) * scale_a[row] * scale_b[col]` per group.
pub fn scaled_grouped_mm_reference(
    inputs: &GroupedMmInputs,
    layout: &OutputLayout,
) -> Result<HostTensor> {
    if inputs.bias.is_some() {
        return Err(SgmmError::Unsupported { feature: "bias" });
    }
    let offsets_len = inputs.offsets.as_ref().map(Vec::len);
    let problem = ProblemShape::from_operands(&inputs.mat_a, &inputs.mat_b, offsets_len)?
        .with_scales(&inputs.scale_a, &inputs.scale_b)?;
    let offsets = GroupOffsets::for_problem(&problem, inputs.offsets.as_deref())?;
    let mut out = layout.allocate();
    let expected = expected_output_sizes(&problem);
    if out.sizes() != expected.as_slice() {
        return Err(SgmmError::OutputShape {
            name: REFERENCE_NAME.to_string(),
            expected,
            got: out.sizes().to_vec(),
        });
    }

    let (a, b) = (&inputs.mat_a, &inputs.mat_b);
    let (sa, sb) = (&inputs.scale_a, &inputs.scale_b);
    let range = |g: usize| offsets.as_ref().map(|o| o.range(g));

    for g in 0..problem.g {
        match problem.class {
            ShapeClass::TwoDTwoD => {
                let ks = range(g).unwrap_or(0..problem.k);
                for row in 0..problem.m {
                    for col in 0..problem.n {
                        let dot: f64 = ks
                            .clone()
                            .map(|k| a.get(&[row, k]) as f64 * b.get(&[k, col]) as f64)
                            .sum();
                        let scale = sa.get(&[g * problem.m + row]) * sb.get(&[g * problem.n + col]);
                        out.set(&[g, row, col], (dot * scale as f64) as f32);
                    }
                }
            }
            ShapeClass::TwoDThreeD => {
                for row in range(g).unwrap_or(0..0) {
                    for col in 0..problem.n {
                        let dot: f64 = (0..problem.k)
                            .map(|k| a.get(&[row, k]) as f64 * b.get(&[g, k, col]) as f64)
                            .sum();
                        let scale = sa.get(&[row]) * sb.get(&[g, col]);
                        out.set(&[row, col], (dot * scale as f64) as f32);
                    }
                }
            }
            ShapeClass::ThreeDTwoD => {
                for row in 0..problem.m {
                    for col in range(g).unwrap_or(0..0) {
                        let dot: f64 = (0..problem.k)
                            .map(|k| a.get(&[g, row, k]) as f64 * b.get(&[k, col]) as f64)
                            .sum();
                        let scale = sa.get(&[g, row]) * sb.get(&[col]);
                        out.set(&[row, col], (dot * scale as f64) as f32);
                    }
                }
            }
            ShapeClass::ThreeDThreeD => {
                for row in 0..problem.m {
                    for col in 0..problem.n {
                        let dot: f64 = (0..problem.k)
                            .map(|k| a.get(&[g, row, k]) as f64 * b.get(&[g, k, col]) as f64)
                            .sum();
                        let scale = sa.get(&[g, row]) * sb.get(&[g, col]);
                        out.set(&[g, row, col], (dot * scale as f64) as f32);
                    }
                }
            }
        }
    }
    Ok(out)
}

fn expected_output_sizes(problem: &ProblemShape) -> Vec<usize> {
    if problem.class.output_is_grouped() {
        vec![problem.g, problem.m, problem.n]
    } else {
        vec![problem.m, problem.n]
    }
}

/// The reference wrapped as an autotuning choice.
#[derive(Clone, Debug)]
pub struct ReferenceChoice {
    layout: OutputLayout,
}

impl ReferenceChoice {
    pub fn new(layout: &OutputLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }
}

impl Choice for ReferenceChoice {
    fn name(&self) -> &str {
        REFERENCE_NAME
    }

    fn is_reference(&self) -> bool {
        true
    }

    fn run(&self, inputs: &GroupedMmInputs, _scratch: &mut RoundScratch<'_>) -> Result<HostTensor> {
        scaled_grouped_mm_reference(inputs, &self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn tensor(sizes: &[usize], values: Vec<f32>) -> HostTensor {
        HostTensor::from_vec(DType::F32, sizes, values).unwrap()
    }

    #[test]
    fn n_split_uses_per_group_columns() {
        // A [2, 1, 2], B logical [2, 3] stored as [3, 2]; offsets split N as 1 + 2.
        let inputs = GroupedMmInputs {
            mat_a: tensor(&[2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]),
            mat_b: tensor(&[3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).transpose_last_two(),
            scale_a: tensor(&[2, 1], vec![1.0, 10.0]),
            scale_b: tensor(&[3], vec![1.0, 1.0, 2.0]),
            offsets: Some(vec![1, 3]),
            bias: None,
            use_fast_accum: false,
        };
        let layout = OutputLayout {
            dtype: DType::F32,
            sizes: vec![1, 3],
        };
        let out = scaled_grouped_mm_reference(&inputs, &layout).unwrap();
        // Column 0 belongs to group 0 (A row [1, 2]); columns 1, 2 to group 1 (A row [3, 4]).
        assert_eq!(out.to_vec(), vec![1.0, 40.0, 140.0]);
    }

    #[test]
    fn wrong_layout_is_reported() {
        let inputs = GroupedMmInputs {
            mat_a: tensor(&[1, 2, 2], vec![1.0; 4]),
            mat_b: tensor(&[1, 2, 2], vec![1.0; 4]).transpose_last_two(),
            scale_a: tensor(&[1, 2], vec![1.0; 2]),
            scale_b: tensor(&[1, 2], vec![1.0; 2]),
            offsets: None,
            bias: None,
            use_fast_accum: false,
        };
        let layout = OutputLayout {
            dtype: DType::F32,
            sizes: vec![2, 2],
        };
        assert!(matches!(
            scaled_grouped_mm_reference(&inputs, &layout),
            Err(SgmmError::OutputShape { .. })
        ));
    }
}
