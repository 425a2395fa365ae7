// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Canonical problem description for scaled grouped GEMM.
//!
//! A is `[M, K]` or `[G, M, K]`, B is logically `[K, N]` or `[G, K, N]` and is
//! stored with K contiguous. Which dimension the offsets split follows from the
//! operand ranks:
//!
//! | A  | B  | split | output      |
//! |----|----|-------|-------------|
//! | 2D | 2D | K     | `[G, M, N]` |
//! | 2D | 3D | M     | `[M, N]`    |
//! | 3D | 2D | N     | `[M, N]`    |
//! | 3D | 3D | none  | `[G, M, N]` |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SgmmError};
use crate::tensor::{DType, HostTensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeClass {
    TwoDTwoD,
    TwoDThreeD,
    ThreeDTwoD,
    ThreeDThreeD,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DynamicDim {
    M,
    N,
    K,
}

impl ShapeClass {
    pub fn from_ranks(a_rank: usize, b_rank: usize) -> Result<Self> {
        let check = |operand, rank| match rank {
            2 | 3 => Ok(rank == 2),
            _ => Err(SgmmError::InvalidRank { operand, rank }),
        };
        let a_2d = check("mat_a", a_rank)?;
        let b_2d = check("mat_b", b_rank)?;
        Ok(match (a_2d, b_2d) {
            (true, true) => ShapeClass::TwoDTwoD,
            (true, false) => ShapeClass::TwoDThreeD,
            (false, true) => ShapeClass::ThreeDTwoD,
            (false, false) => ShapeClass::ThreeDThreeD,
        })
    }

    pub fn a_is_2d(self) -> bool {
        matches!(self, ShapeClass::TwoDTwoD | ShapeClass::TwoDThreeD)
    }

    pub fn b_is_2d(self) -> bool {
        matches!(self, ShapeClass::TwoDTwoD | ShapeClass::ThreeDTwoD)
    }

    pub fn dynamic_dim(self) -> Option<DynamicDim> {
        match self {
            ShapeClass::TwoDTwoD => Some(DynamicDim::K),
            ShapeClass::TwoDThreeD => Some(DynamicDim::M),
            ShapeClass::ThreeDTwoD => Some(DynamicDim::N),
            ShapeClass::ThreeDThreeD => None,
        }
    }

    pub fn requires_offsets(self) -> bool {
        self.dynamic_dim().is_some()
    }

    /// Output has a leading group axis only when neither M nor N is split.
    pub fn output_is_grouped(self) -> bool {
        !matches!(
            self.dynamic_dim(),
            Some(DynamicDim::M) | Some(DynamicDim::N)
        )
    }

    fn pattern(self) -> &'static str {
        match self {
            ShapeClass::TwoDTwoD => "both operands are 2-D",
            ShapeClass::TwoDThreeD => "mat_a is 2-D and mat_b is 3-D",
            ShapeClass::ThreeDTwoD => "mat_a is 3-D and mat_b is 2-D",
            ShapeClass::ThreeDThreeD => "both operands are 3-D",
        }
    }
}

/// Element strides of one operand: group, outer (M for A, N for B) and K.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandStrides {
    pub group: Option<usize>,
    pub outer: usize,
    pub k: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemShape {
    pub class: ShapeClass,
    pub g: usize,
    /// Full extents; for the split dimension this is the total across groups.
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub strides_a: OperandStrides,
    pub strides_b: OperandStrides,
    pub scale_a_stride_g: Option<usize>,
    pub scale_b_stride_g: Option<usize>,
    pub dtype: DType,
}

impl ProblemShape {
    /// Normalises operand shapes into a problem record.
    ///
    /// Fails on ranks other than 2/3, on K or G mismatches, and when offsets
    /// are missing for a split pattern or present for the 3-D × 3-D pattern.
    pub fn from_operands(
        mat_a: &HostTensor,
        mat_b: &HostTensor,
        offsets_len: Option<usize>,
    ) -> Result<Self> {
        let class = ShapeClass::from_ranks(mat_a.rank(), mat_b.rank())?;
        let a = mat_a.sizes();
        let b = mat_b.sizes();

        let (g, m, a_k, b_k, n) = match class {
            ShapeClass::TwoDTwoD => {
                let g = offsets_len.ok_or(SgmmError::MissingOffsets {
                    pattern: class.pattern(),
                })?;
                (g, a[0], a[1], b[0], b[1])
            }
            ShapeClass::TwoDThreeD => (b[0], a[0], a[1], b[1], b[2]),
            ShapeClass::ThreeDTwoD => (a[0], a[1], a[2], b[0], b[1]),
            ShapeClass::ThreeDThreeD => {
                if a[0] != b[0] {
                    return Err(SgmmError::GroupMismatch {
                        a_groups: a[0],
                        b_groups: b[0],
                    });
                }
                (a[0], a[1], a[2], b[1], b[2])
            }
        };
        if a_k != b_k {
            return Err(SgmmError::ContractionMismatch { a_k, b_k });
        }
        match (class.requires_offsets(), offsets_len) {
            (true, None) => {
                return Err(SgmmError::MissingOffsets {
                    pattern: class.pattern(),
                })
            }
            (false, Some(_)) => {
                return Err(SgmmError::UnexpectedOffsets {
                    pattern: class.pattern(),
                })
            }
            _ => {}
        }

        let sa = mat_a.strides();
        let sb = mat_b.strides();
        let strides_a = OperandStrides {
            group: (!class.a_is_2d()).then(|| sa[0]),
            outer: sa[sa.len() - 2],
            k: sa[sa.len() - 1],
        };
        // B is logically [.., K, N]: N is the last logical dim, K the one before.
        let strides_b = OperandStrides {
            group: (!class.b_is_2d()).then(|| sb[0]),
            outer: sb[sb.len() - 1],
            k: sb[sb.len() - 2],
        };

        Ok(Self {
            class,
            g,
            m,
            n,
            k: a_k,
            strides_a,
            strides_b,
            scale_a_stride_g: None,
            scale_b_stride_g: None,
            dtype: mat_a.dtype(),
        })
    }

    /// Checks the scale tensors against the problem and records their group
    /// strides.
    pub fn with_scales(mut self, scale_a: &HostTensor, scale_b: &HostTensor) -> Result<Self> {
        let expected_a = match (self.class.a_is_2d(), self.class.dynamic_dim()) {
            (true, Some(DynamicDim::K)) => vec![self.g * self.m],
            (true, _) => vec![self.m],
            (false, _) => vec![self.g, self.m],
        };
        let expected_b = match (self.class.b_is_2d(), self.class.dynamic_dim()) {
            (true, Some(DynamicDim::K)) => vec![self.g * self.n],
            (true, _) => vec![self.n],
            (false, _) => vec![self.g, self.n],
        };
        check_scale("scale_a", scale_a, &expected_a)?;
        check_scale("scale_b", scale_b, &expected_b)?;
        self.scale_a_stride_g = (scale_a.rank() == 2).then(|| scale_a.strides()[0]);
        self.scale_b_stride_g = (scale_b.rank() == 2).then(|| scale_b.strides()[0]);
        Ok(self)
    }

    pub fn a_is_2d(&self) -> bool {
        self.class.a_is_2d()
    }

    pub fn b_is_2d(&self) -> bool {
        self.class.b_is_2d()
    }

    pub fn m_dynamic(&self) -> bool {
        self.class.dynamic_dim() == Some(DynamicDim::M)
    }

    pub fn n_dynamic(&self) -> bool {
        self.class.dynamic_dim() == Some(DynamicDim::N)
    }

    pub fn k_dynamic(&self) -> bool {
        self.class.dynamic_dim() == Some(DynamicDim::K)
    }

    /// Extent of the split dimension, which the last offset must reach.
    pub fn dynamic_extent(&self) -> Option<usize> {
        self.class.dynamic_dim().map(|dim| match dim {
            DynamicDim::M => self.m,
            DynamicDim::N => self.n,
            DynamicDim::K => self.k,
        })
    }

    /// Per-group M used by the pruner. Split extents are rounded up to a power
    /// of two before dividing, which over-estimates on purpose.
    pub fn m_per_group(&self) -> usize {
        per_group(self.m, self.g, self.m_dynamic())
    }

    pub fn n_per_group(&self) -> usize {
        per_group(self.n, self.g, self.n_dynamic())
    }
}

fn per_group(extent: usize, groups: usize, dynamic: bool) -> usize {
    if !dynamic {
        return extent;
    }
    next_power_of_two(extent).checked_div(groups).unwrap_or(0)
}

/// Smallest power of two `>= n`, with `0` mapping to `0`.
pub fn next_power_of_two(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        n.next_power_of_two()
    }
}

fn check_scale(operand: &'static str, scale: &HostTensor, expected: &[usize]) -> Result<()> {
    if scale.sizes() != expected {
        return Err(SgmmError::ScaleShape {
            operand,
            expected: expected.to_vec(),
            got: scale.sizes().to_vec(),
        });
    }
    let last = scale.rank() - 1;
    if scale.sizes()[last] > 1 && scale.strides()[last] != 1 {
        return Err(SgmmError::UnsupportedStride {
            operand,
            detail: format!("last stride must be 1, got {:?}", scale.strides()),
        });
    }
    Ok(())
}

/// A must be K-contiguous (row major); B must be K-contiguous as well, i.e.
/// stored transposed. Operands with an empty leading dimension are exempt.
pub fn check_supported_striding(mat_a: &HostTensor, mat_b: &HostTensor) -> Result<()> {
    let has_zero_dim = |t: &HostTensor| t.sizes().iter().take(2).any(|&size| size == 0);

    let sa = mat_a.strides();
    if sa[sa.len() - 1] != 1 && !has_zero_dim(mat_a) {
        return Err(SgmmError::UnsupportedStride {
            operand: "mat_a",
            detail: format!("expected row-major storage, got strides {sa:?}"),
        });
    }
    let sb = mat_b.strides();
    if sb[sb.len() - 2] != 1 && !has_zero_dim(mat_b) {
        return Err(SgmmError::UnsupportedStride {
            operand: "mat_b",
            detail: format!("expected column-major storage, got strides {sb:?}"),
        });
    }
    Ok(())
}

/// Fixed output layout: dtype plus sizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLayout {
    pub dtype: DType,
    pub sizes: Vec<usize>,
}

impl OutputLayout {
    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    pub fn is_nonzero(&self) -> bool {
        self.numel() > 0
    }

    pub fn allocate(&self) -> HostTensor {
        HostTensor::zeros(self.dtype, &self.sizes)
    }
}

impl fmt::Display for OutputLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedLayout(dtype={}, size={:?})", self.dtype, self.sizes)
    }
}

/// Resolves the output layout for the operator.
///
/// An explicit `layout` wins, but combining it with `out_dtype` is rejected.
/// Otherwise the dtype defaults to A's dtype and the sizes follow the rank
/// table in the module docs.
pub fn resolve_output_layout(
    mat_a: &HostTensor,
    mat_b: &HostTensor,
    offsets_len: Option<usize>,
    out_dtype: Option<DType>,
    layout: Option<OutputLayout>,
) -> Result<OutputLayout> {
    let class = ShapeClass::from_ranks(mat_a.rank(), mat_b.rank())?;
    if let Some(layout) = layout {
        if out_dtype.is_some() {
            return Err(SgmmError::LayoutConflict);
        }
        return Ok(layout);
    }
    let a = mat_a.sizes();
    let b = mat_b.sizes();
    let sizes = match class {
        ShapeClass::TwoDTwoD => {
            let g = offsets_len.ok_or(SgmmError::MissingOffsets {
                pattern: class.pattern(),
            })?;
            vec![g, a[0], b[1]]
        }
        ShapeClass::TwoDThreeD => vec![a[0], b[2]],
        ShapeClass::ThreeDTwoD => vec![a[1], b[1]],
        ShapeClass::ThreeDThreeD => vec![a[0], a[1], b[2]],
    };
    Ok(OutputLayout {
        dtype: out_dtype.unwrap_or(mat_a.dtype()),
        sizes,
    })
}
