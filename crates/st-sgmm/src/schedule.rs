// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Persistent grouped-tile scheduling.
//!
//! A fixed number of execution contexts share the flattened list of
//! `(group, tile)` work items. Context `c` handles global tiles `c`,
//! `c + units`, `c + 2 * units`, ... and walks the groups in order, keeping a
//! running count of the tiles owned by the groups it has already passed.
//! Inside a group, tiles are decoded M-major.
//!
//! [`ContextTiles`] is the per-context walk. [`GroupTilePlan`] answers the same
//! question from a prefix sum and exists to cross-check the walk and to size
//! launches.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config_space::KernelConfig;
use crate::error::{Result, SgmmError};
use crate::problem::ProblemShape;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OffsetsError {
    #[error("expected {expected} group offsets, got {got}")]
    Length { expected: usize, got: usize },
    #[error("group offset {index} is negative ({value})")]
    Negative { index: usize, value: i32 },
    #[error("group offsets must be non-decreasing: offsets[{index}]={value} after {previous}")]
    Decreasing {
        index: usize,
        previous: usize,
        value: usize,
    },
    #[error("last group offset {last} does not match the split extent {extent}")]
    FinalMismatch { last: usize, extent: usize },
}

/// Validated cumulative group ends along the split dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupOffsets {
    ends: Vec<usize>,
}

impl GroupOffsets {
    pub fn new(raw: &[i32], groups: usize, extent: usize) -> std::result::Result<Self, OffsetsError> {
        if raw.len() != groups {
            return Err(OffsetsError::Length {
                expected: groups,
                got: raw.len(),
            });
        }
        let mut ends = Vec::with_capacity(raw.len());
        let mut previous = 0usize;
        for (index, &value) in raw.iter().enumerate() {
            let end = usize::try_from(value).map_err(|_| OffsetsError::Negative { index, value })?;
            if end < previous {
                return Err(OffsetsError::Decreasing {
                    index,
                    previous,
                    value: end,
                });
            }
            previous = end;
            ends.push(end);
        }
        let last = ends.last().copied().unwrap_or(0);
        if last != extent {
            return Err(OffsetsError::FinalMismatch { last, extent });
        }
        Ok(Self { ends })
    }

    /// Validates `raw` against the problem, or checks that no offsets were
    /// given when nothing is split.
    pub fn for_problem(problem: &ProblemShape, raw: Option<&[i32]>) -> Result<Option<Self>> {
        match (problem.dynamic_extent(), raw) {
            (Some(extent), Some(raw)) => Ok(Some(Self::new(raw, problem.g, extent)?)),
            (None, None) => Ok(None),
            (Some(_), None) => Err(SgmmError::MissingOffsets {
                pattern: "a dimension is split across groups",
            }),
            (None, Some(_)) => Err(SgmmError::UnexpectedOffsets {
                pattern: "no dimension is split across groups",
            }),
        }
    }

    pub fn ends(&self) -> &[usize] {
        &self.ends
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn range(&self, group: usize) -> Range<usize> {
        let start = if group == 0 { 0 } else { self.ends[group - 1] };
        start..self.ends[group]
    }

    /// Group whose range contains `position`, skipping empty groups.
    pub fn group_of(&self, position: usize) -> Option<usize> {
        let group = self.ends.partition_point(|&end| end <= position);
        (group < self.ends.len()).then_some(group)
    }
}

/// Block sizes the scheduler and kernel body tile with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileShape {
    pub block_m: usize,
    pub block_n: usize,
    pub block_k: usize,
}

impl TileShape {
    pub fn new(block_m: usize, block_n: usize, block_k: usize) -> Self {
        Self {
            block_m,
            block_n,
            block_k,
        }
    }
}

impl From<&KernelConfig> for TileShape {
    fn from(config: &KernelConfig) -> Self {
        Self::new(
            config.block_m as usize,
            config.block_n as usize,
            config.block_k as usize,
        )
    }
}

/// Launch grid: one context per compute unit, laid out along x.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchGrid {
    num_units: usize,
}

impl LaunchGrid {
    pub fn new(num_units: usize) -> Self {
        Self {
            num_units: num_units.max(1),
        }
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.num_units, 1, 1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkTile {
    pub group: usize,
    pub tile_m: usize,
    pub tile_n: usize,
}

/// Resolved extents of one group. Sizes are zero for groups the walk skips.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpan {
    pub group: usize,
    pub m_start: usize,
    pub m_size: usize,
    pub n_start: usize,
    pub n_size: usize,
    pub k_start: usize,
    pub k_size: usize,
}

impl GroupSpan {
    pub fn num_m_tiles(&self, tile: TileShape) -> usize {
        self.m_size.div_ceil(tile.block_m)
    }

    pub fn num_n_tiles(&self, tile: TileShape) -> usize {
        self.n_size.div_ceil(tile.block_n)
    }

    pub fn num_tiles(&self, tile: TileShape) -> usize {
        if self.m_size == 0 {
            return 0;
        }
        self.num_m_tiles(tile) * self.num_n_tiles(tile)
    }
}

/// Moves across groups, deriving each group's extents from the offsets.
///
/// The M cursor moves for every group; the N and K cursors only move for
/// groups with rows. With a single split dimension the two are equivalent.
#[derive(Clone, Debug)]
pub struct GroupCursor<'a> {
    problem: &'a ProblemShape,
    offsets: Option<&'a GroupOffsets>,
    group: usize,
    m_end: usize,
    n_end: usize,
    k_end: usize,
}

impl<'a> GroupCursor<'a> {
    pub fn new(problem: &'a ProblemShape, offsets: Option<&'a GroupOffsets>) -> Self {
        Self {
            problem,
            offsets,
            group: 0,
            m_end: 0,
            n_end: 0,
            k_end: 0,
        }
    }

    fn offset(&self, group: usize) -> usize {
        self.offsets.map_or(0, |offsets| offsets.ends()[group])
    }
}

impl Iterator for GroupCursor<'_> {
    type Item = GroupSpan;

    fn next(&mut self) -> Option<GroupSpan> {
        let g = self.group;
        if g >= self.problem.g {
            return None;
        }
        self.group += 1;

        let mut span = GroupSpan {
            group: g,
            ..GroupSpan::default()
        };
        if self.problem.m_dynamic() {
            span.m_start = self.m_end;
            self.m_end = self.offset(g);
            span.m_size = self.m_end - span.m_start;
        } else {
            span.m_size = self.problem.m;
        }
        if span.m_size == 0 {
            return Some(span);
        }

        if self.problem.n_dynamic() {
            span.n_start = self.n_end;
            self.n_end = self.offset(g);
            span.n_size = self.n_end - span.n_start;
        } else {
            span.n_size = self.problem.n;
        }
        if self.problem.k_dynamic() {
            span.k_start = self.k_end;
            self.k_end = self.offset(g);
            span.k_size = self.k_end - span.k_start;
        } else {
            span.k_size = self.problem.k;
        }
        Some(span)
    }
}

/// One unit of work handed to a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledTile {
    pub context: usize,
    pub global_index: usize,
    pub tile: WorkTile,
    pub span: GroupSpan,
    /// Rows of the group covered by this tile, clipped to the group.
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

/// Tiles visited by one context, in visiting order.
#[derive(Clone, Debug)]
pub struct ContextTiles<'a> {
    cursor: GroupCursor<'a>,
    tile: TileShape,
    context: usize,
    num_units: usize,
    tidx: usize,
    iterated_tiles: usize,
    current: Option<(GroupSpan, usize, usize)>,
}

impl<'a> ContextTiles<'a> {
    pub fn new(
        problem: &'a ProblemShape,
        offsets: Option<&'a GroupOffsets>,
        tile: TileShape,
        context: usize,
        grid: LaunchGrid,
    ) -> Self {
        Self {
            cursor: GroupCursor::new(problem, offsets),
            tile,
            context,
            num_units: grid.num_units(),
            tidx: context,
            iterated_tiles: 0,
            current: None,
        }
    }
}

impl Iterator for ContextTiles<'_> {
    type Item = ScheduledTile;

    fn next(&mut self) -> Option<ScheduledTile> {
        loop {
            if let Some((span, num_m_tiles, num_tiles)) = self.current {
                if self.tidx >= self.iterated_tiles && self.tidx < self.iterated_tiles + num_tiles {
                    let global_index = self.tidx;
                    let local = global_index - self.iterated_tiles;
                    let tile = WorkTile {
                        group: span.group,
                        tile_m: local % num_m_tiles,
                        tile_n: local / num_m_tiles,
                    };
                    self.tidx += self.num_units;
                    return Some(scheduled(self.context, global_index, tile, span, self.tile));
                }
                self.iterated_tiles += num_tiles;
                self.current = None;
            }
            let span = self.cursor.next()?;
            if span.m_size > 0 {
                self.current = Some((span, span.num_m_tiles(self.tile), span.num_tiles(self.tile)));
            }
        }
    }
}

fn scheduled(
    context: usize,
    global_index: usize,
    tile: WorkTile,
    span: GroupSpan,
    shape: TileShape,
) -> ScheduledTile {
    let row0 = tile.tile_m * shape.block_m;
    let col0 = tile.tile_n * shape.block_n;
    ScheduledTile {
        context,
        global_index,
        tile,
        span,
        rows: row0..(row0 + shape.block_m).min(span.m_size),
        cols: col0..(col0 + shape.block_n).min(span.n_size),
    }
}

/// Prefix-sum view of the flattened tile list.
#[derive(Clone, Debug)]
pub struct GroupTilePlan {
    tile: TileShape,
    spans: Vec<GroupSpan>,
    /// `starts[g]` is the first global tile of group `g`; the last entry is
    /// the total.
    starts: Vec<usize>,
}

impl GroupTilePlan {
    pub fn new(problem: &ProblemShape, offsets: Option<&GroupOffsets>, tile: TileShape) -> Self {
        let spans: Vec<GroupSpan> = GroupCursor::new(problem, offsets).collect();
        let mut starts = Vec::with_capacity(spans.len() + 1);
        let mut total = 0usize;
        starts.push(0);
        for span in &spans {
            total += span.num_tiles(tile);
            starts.push(total);
        }
        Self {
            tile,
            spans,
            starts,
        }
    }

    pub fn total_tiles(&self) -> usize {
        self.starts.last().copied().unwrap_or(0)
    }

    pub fn spans(&self) -> &[GroupSpan] {
        &self.spans
    }

    /// Work tile at flattened position `global`.
    pub fn locate(&self, global: usize) -> Option<WorkTile> {
        if global >= self.total_tiles() {
            return None;
        }
        let group = self.starts.partition_point(|&start| start <= global) - 1;
        let span = &self.spans[group];
        let local = global - self.starts[group];
        let num_m_tiles = span.num_m_tiles(self.tile);
        Some(WorkTile {
            group,
            tile_m: local % num_m_tiles,
            tile_n: local / num_m_tiles,
        })
    }

    /// Work tiles context `context` visits, by direct lookup.
    pub fn tiles_for_context(&self, context: usize, grid: LaunchGrid) -> Vec<WorkTile> {
        (context..self.total_tiles())
            .step_by(grid.num_units())
            .filter_map(|global| self.locate(global))
            .collect()
    }

    /// Every work tile, group by group, as the Cartesian product of each
    /// group's M and N tile ranges.
    pub fn all_tiles(&self) -> Vec<WorkTile> {
        let mut tiles = Vec::with_capacity(self.total_tiles());
        for span in self.spans.iter().filter(|span| span.m_size > 0) {
            for tile_n in 0..span.num_n_tiles(self.tile) {
                for tile_m in 0..span.num_m_tiles(self.tile) {
                    tiles.push(WorkTile {
                        group: span.group,
                        tile_m,
                        tile_n,
                    });
                }
            }
        }
        tiles
    }
}

/// Runs the walk for every context of `grid`.
pub fn simulate_all_contexts(
    problem: &ProblemShape,
    offsets: Option<&GroupOffsets>,
    tile: TileShape,
    grid: LaunchGrid,
) -> Vec<Vec<ScheduledTile>> {
    (0..grid.num_units())
        .map(|context| ContextTiles::new(problem, offsets, tile, context, grid).collect())
        .collect()
}
