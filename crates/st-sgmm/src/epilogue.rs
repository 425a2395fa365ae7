// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Scale-and-store stage applied to every finished tile.

use crate::error::{Result, SgmmError};
use crate::problem::ProblemShape;
use crate::schedule::{GroupSpan, ScheduledTile, TileShape};
use crate::tensor::HostTensor;

/// fp32 accumulator for one `BLOCK_M x BLOCK_N` tile, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct TileAccumulator {
    block_m: usize,
    block_n: usize,
    values: Vec<f32>,
}

impl TileAccumulator {
    pub fn zeros(tile: TileShape) -> Self {
        Self {
            block_m: tile.block_m,
            block_n: tile.block_n,
            values: vec![0.0; tile.block_m * tile.block_n],
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.values[row * self.block_n + col]
    }

    #[inline]
    pub fn add(&mut self, row: usize, col: usize, value: f32) {
        self.values[row * self.block_n + col] += value;
    }

    /// Adds a partial tile accumulated separately.
    pub fn merge(&mut self, partial: &TileAccumulator) {
        debug_assert_eq!(self.values.len(), partial.values.len());
        for (dst, src) in self.values.iter_mut().zip(&partial.values) {
            *dst += *src;
        }
    }

    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }

    pub fn block_m(&self) -> usize {
        self.block_m
    }

    pub fn block_n(&self) -> usize {
        self.block_n
    }
}

/// Flat offset of the first row scale for `span`.
pub fn row_scale_base(problem: &ProblemShape, span: &GroupSpan) -> usize {
    if problem.a_is_2d() {
        if problem.m_dynamic() {
            span.m_start
        } else {
            span.group * problem.m
        }
    } else {
        span.group * problem.scale_a_stride_g.unwrap_or(problem.m)
    }
}

/// Flat offset of the first column scale for `span`.
pub fn col_scale_base(problem: &ProblemShape, span: &GroupSpan) -> usize {
    if problem.b_is_2d() {
        if problem.n_dynamic() {
            span.n_start
        } else {
            span.group * problem.n
        }
    } else {
        span.group * problem.scale_b_stride_g.unwrap_or(problem.n)
    }
}

/// Output position of a tile's first element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputCoord {
    /// `[M, N]` output, used when M or N is split across groups.
    Flat { row: usize, col: usize },
    /// `[G, M, N]` output.
    Grouped { group: usize, row: usize, col: usize },
}

/// Scaled values of one tile, ready to be written to the output.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredTile {
    pub origin: OutputCoord,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
}

impl StoredTile {
    pub fn scatter_into(&self, out: &mut HostTensor) -> Result<()> {
        let (prefix, row, col) = match self.origin {
            OutputCoord::Flat { row, col } => (None, row, col),
            OutputCoord::Grouped { group, row, col } => (Some(group), row, col),
        };
        let expected_rank = if prefix.is_some() { 3 } else { 2 };
        let sizes = out.sizes().to_vec();
        let fits = sizes.len() == expected_rank
            && prefix.map_or(true, |g| g < sizes[0])
            && row + self.rows <= sizes[expected_rank - 2]
            && col + self.cols <= sizes[expected_rank - 1];
        if !fits {
            return Err(SgmmError::launch(format!(
                "tile {:?} of {}x{} does not fit output {:?}",
                self.origin, self.rows, self.cols, sizes
            )));
        }
        let mut index = Vec::with_capacity(expected_rank);
        for r in 0..self.rows {
            for c in 0..self.cols {
                index.clear();
                index.extend(prefix);
                index.push(row + r);
                index.push(col + c);
                out.set(&index, self.values[r * self.cols + c]);
            }
        }
        Ok(())
    }
}

/// Multiplies the accumulator by the row and column scales and keeps the
/// in-bounds part of the tile.
pub fn scale_and_store(
    problem: &ProblemShape,
    tile: &ScheduledTile,
    acc: &TileAccumulator,
    scale_a: &HostTensor,
    scale_b: &HostTensor,
) -> StoredTile {
    let span = &tile.span;
    let row_base = row_scale_base(problem, span);
    let col_base = col_scale_base(problem, span);
    let row0 = tile.tile.tile_m * acc.block_m();
    let col0 = tile.tile.tile_n * acc.block_n();
    let rows = tile.rows.len();
    let cols = tile.cols.len();

    let mut values = Vec::with_capacity(rows * cols);
    for local_row in tile.rows.clone() {
        let s_row = scale_a.at_offset(row_base + local_row);
        for local_col in tile.cols.clone() {
            let s_col = scale_b.at_offset(col_base + local_col);
            values.push(acc.get(local_row - row0, local_col - col0) * s_row * s_col);
        }
    }

    let origin = if problem.m_dynamic() || problem.n_dynamic() {
        OutputCoord::Flat {
            row: span.m_start + tile.rows.start,
            col: span.n_start + tile.cols.start,
        }
    } else {
        OutputCoord::Grouped {
            group: span.group,
            row: tile.rows.start,
            col: tile.cols.start,
        }
    };
    StoredTile {
        origin,
        rows,
        cols,
        values,
    }
}
