// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Host execution of a generated kernel.
//!
//! Each execution context walks its tiles with [`ContextTiles`], accumulates
//! them in `BLOCK_K` chunks and hands the scaled tiles back. Contexts run on
//! the rayon pool and never share mutable state; tiles are disjoint, so the
//! results are scattered into the output once every context has finished.

use rayon::prelude::*;
use tracing::trace;

use crate::autotune::{Choice, GroupedMmInputs};
use crate::codegen::{render_kernel, KernelOptions, KernelSource};
use crate::config_space::KernelConfig;
use crate::epilogue::{scale_and_store, StoredTile, TileAccumulator};
use crate::error::{Result, SgmmError};
use crate::problem::{OutputLayout, ProblemShape};
use crate::schedule::{ContextTiles, GroupOffsets, LaunchGrid, ScheduledTile, TileShape};
use crate::scratch::RoundScratch;
use crate::tensor::HostTensor;

/// Bytes of one encoded tensor descriptor.
pub const DESCRIPTOR_BYTES: usize = 128;
/// Scratch needed per launch: one descriptor for A and one for B.
pub const DESCRIPTOR_SCRATCH_BYTES: usize = 2 * DESCRIPTOR_BYTES;
pub const DESCRIPTOR_ALIGNMENT: usize = 64;

#[derive(Clone, Debug)]
pub struct GeneratedKernel {
    source: KernelSource,
    problem: ProblemShape,
    tile: TileShape,
    grid: LaunchGrid,
    layout: OutputLayout,
}

impl GeneratedKernel {
    pub fn new(
        problem: &ProblemShape,
        config: &KernelConfig,
        options: KernelOptions,
        layout: &OutputLayout,
    ) -> Result<Self> {
        let source = render_kernel(problem, config, &options)?;
        Ok(Self {
            source,
            problem: problem.clone(),
            tile: TileShape::from(config),
            grid: LaunchGrid::new(options.num_units),
            layout: layout.clone(),
        })
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    pub fn grid(&self) -> LaunchGrid {
        self.grid
    }

    fn stage_descriptors(&self, inputs: &GroupedMmInputs, scratch: &mut RoundScratch<'_>) -> Result<()> {
        let buffer = scratch.acquire(DESCRIPTOR_SCRATCH_BYTES, DESCRIPTOR_ALIGNMENT)?;
        let bytes = buffer.as_mut_slice();
        encode_descriptor(
            &mut bytes[..DESCRIPTOR_BYTES],
            inputs.mat_a.sizes(),
            inputs.mat_a.strides(),
            [self.tile.block_m, self.tile.block_k],
        );
        encode_descriptor(
            &mut bytes[DESCRIPTOR_BYTES..DESCRIPTOR_SCRATCH_BYTES],
            inputs.mat_b.sizes(),
            inputs.mat_b.strides(),
            [self.tile.block_n, self.tile.block_k],
        );
        Ok(())
    }

    fn run_context(
        &self,
        context: usize,
        offsets: Option<&GroupOffsets>,
        inputs: &GroupedMmInputs,
    ) -> Vec<StoredTile> {
        let fast_accum = self.source.options.fast_accum;
        ContextTiles::new(&self.problem, offsets, self.tile, context, self.grid)
            .map(|tile| {
                let acc = accumulate_tile(&self.problem, &tile, self.tile, inputs, fast_accum);
                scale_and_store(&self.problem, &tile, &acc, &inputs.scale_a, &inputs.scale_b)
            })
            .collect()
    }
}

impl Choice for GeneratedKernel {
    fn name(&self) -> &str {
        &self.source.name
    }

    fn run(&self, inputs: &GroupedMmInputs, scratch: &mut RoundScratch<'_>) -> Result<HostTensor> {
        if inputs.bias.is_some() {
            return Err(SgmmError::Unsupported { feature: "bias" });
        }
        let offsets = GroupOffsets::for_problem(&self.problem, inputs.offsets.as_deref())?;
        if self.source.options.use_descriptor_loads {
            self.stage_descriptors(inputs, scratch)?;
        }

        let offsets = offsets.as_ref();
        let per_context: Vec<Vec<StoredTile>> = (0..self.grid.num_units())
            .into_par_iter()
            .map(|context| self.run_context(context, offsets, inputs))
            .collect();

        let mut out = self.layout.allocate();
        let mut tiles = 0usize;
        for stored in per_context.iter().flatten() {
            stored.scatter_into(&mut out)?;
            tiles += 1;
        }
        trace!(kernel = %self.source.name, tiles, "generated kernel finished");
        Ok(out)
    }
}

/// Accumulates one tile over the group's K range in `BLOCK_K` chunks. Rows and
/// columns outside the group stay zero, as does the padded tail of the last
/// chunk.
pub fn accumulate_tile(
    problem: &ProblemShape,
    tile: &ScheduledTile,
    shape: TileShape,
    inputs: &GroupedMmInputs,
    fast_accum: bool,
) -> TileAccumulator {
    let span = &tile.span;
    let g = span.group;
    let a_base = problem.strides_a.group.map_or(0, |stride| g * stride);
    let b_base = problem.strides_b.group.map_or(0, |stride| g * stride);
    let row0 = tile.tile.tile_m * shape.block_m;
    let col0 = tile.tile.tile_n * shape.block_n;

    let mut acc = TileAccumulator::zeros(shape);
    let mut partial = TileAccumulator::zeros(shape);
    let mut k_offset = 0;
    while k_offset < span.k_size {
        let chunk = shape.block_k.min(span.k_size - k_offset);
        let target = if fast_accum { &mut acc } else { &mut partial };
        for row in tile.rows.clone() {
            let a_row = a_base + (span.m_start + row) * problem.strides_a.outer;
            for col in tile.cols.clone() {
                let b_col = b_base + (span.n_start + col) * problem.strides_b.outer;
                let mut dot = 0.0f32;
                for kk in 0..chunk {
                    let k = span.k_start + k_offset + kk;
                    dot += inputs.mat_a.at_offset(a_row + k * problem.strides_a.k)
                        * inputs.mat_b.at_offset(b_col + k * problem.strides_b.k);
                }
                target.add(row - row0, col - col0, dot);
            }
        }
        if !fast_accum {
            acc.merge(&partial);
            partial.clear();
        }
        k_offset += shape.block_k;
    }
    acc
}

/// Little-endian descriptor record: rank, sizes, strides and block shape.
fn encode_descriptor(out: &mut [u8], sizes: &[usize], strides: &[usize], block: [usize; 2]) {
    out.iter_mut().for_each(|byte| *byte = 0);
    let words = std::iter::once(sizes.len())
        .chain(sizes.iter().copied())
        .chain(strides.iter().copied())
        .chain(block);
    for (slot, word) in out.chunks_exact_mut(8).zip(words) {
        slot.copy_from_slice(&(word as u64).to_le_bytes());
    }
}
