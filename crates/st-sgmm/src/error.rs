// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use thiserror::Error;

use crate::schedule::OffsetsError;

pub type Result<T> = std::result::Result<T, SgmmError>;

#[derive(Debug, Error)]
pub enum SgmmError {
    /// Operands must be matrices or stacks of matrices.
    #[error("{operand} must have rank 2 or 3, got rank {rank}")]
    InvalidRank { operand: &'static str, rank: usize },
    /// Contraction extents disagree between the two operands.
    #[error("contraction dimension mismatch: A has K={a_k}, B has K={b_k}")]
    ContractionMismatch { a_k: usize, b_k: usize },
    /// Both operands are 3-D but carry different group counts.
    #[error("group count mismatch: A has {a_groups} groups, B has {b_groups}")]
    GroupMismatch { a_groups: usize, b_groups: usize },
    /// An explicit output layout and an output dtype were both requested.
    #[error("out_dtype is ignored if layout is specified; pass only one of them")]
    LayoutConflict,
    #[error("unsupported striding for {operand}: {detail}")]
    UnsupportedStride {
        operand: &'static str,
        detail: String,
    },
    #[error("{operand} has shape {got:?}, expected {expected:?}")]
    ScaleShape {
        operand: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("offsets are required when {pattern}")]
    MissingOffsets { pattern: &'static str },
    #[error("offsets must be absent when {pattern}")]
    UnexpectedOffsets { pattern: &'static str },
    #[error(transparent)]
    Offsets(#[from] OffsetsError),
    #[error("tensor storage of {len} elements cannot hold sizes {sizes:?} with strides {strides:?}")]
    Storage {
        sizes: Vec<usize>,
        strides: Vec<usize>,
        len: usize,
    },
    #[error("{feature} is not supported by scaled grouped mm")]
    Unsupported { feature: &'static str },
    #[error("candidate {name} produced shape {got:?}, layout expects {expected:?}")]
    OutputShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("scratch allocation of {size} bytes (align {alignment}) failed: {reason}")]
    Scratch {
        size: usize,
        alignment: usize,
        reason: String,
    },
    #[error("no valid candidate left for {name}")]
    NoCandidates { name: String },
    #[error("kernel source generation failed: {0}")]
    Codegen(String),
    #[error("kernel launch failed: {0}")]
    Launch(String),
}

impl SgmmError {
    pub fn launch(message: impl Into<String>) -> Self {
        SgmmError::Launch(message.into())
    }
}
