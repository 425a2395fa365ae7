// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeSet;

use proptest::prelude::*;
use st_sgmm::problem::OperandStrides;
use st_sgmm::schedule::{LaunchGrid, TileShape};
use st_sgmm::{
    simulate_all_contexts, DType, GroupOffsets, GroupTilePlan, ProblemShape, ShapeClass, WorkTile,
};

fn problem(class: ShapeClass, g: usize, m: usize, n: usize, k: usize) -> ProblemShape {
    let strides = OperandStrides {
        group: None,
        outer: k,
        k: 1,
    };
    ProblemShape {
        class,
        g,
        m,
        n,
        k,
        strides_a: strides,
        strides_b: strides,
        scale_a_stride_g: None,
        scale_b_stride_g: None,
        dtype: DType::F8E4M3,
    }
}

/// Cumulative offsets from per-group sizes.
fn cumulative(sizes: &[usize]) -> Vec<i32> {
    sizes
        .iter()
        .scan(0usize, |acc, size| {
            *acc += size;
            Some(*acc as i32)
        })
        .collect()
}

/// Expected tiles straight from per-group extents.
fn expected_tiles(extents: &[(usize, usize)], tile: TileShape) -> BTreeSet<WorkTile> {
    let mut tiles = BTreeSet::new();
    for (group, &(rows, cols)) in extents.iter().enumerate() {
        if rows == 0 || cols == 0 {
            continue;
        }
        for tile_m in 0..rows.div_ceil(tile.block_m) {
            for tile_n in 0..cols.div_ceil(tile.block_n) {
                tiles.insert(WorkTile {
                    group,
                    tile_m,
                    tile_n,
                });
            }
        }
    }
    tiles
}

fn assert_complete(
    p: &ProblemShape,
    offsets: Option<&GroupOffsets>,
    tile: TileShape,
    units: usize,
    expected: BTreeSet<WorkTile>,
) {
    let grid = LaunchGrid::new(units);
    let per_context = simulate_all_contexts(p, offsets, tile, grid);
    let visited: Vec<WorkTile> = per_context.iter().flatten().map(|t| t.tile).collect();
    let unique: BTreeSet<WorkTile> = visited.iter().copied().collect();
    assert_eq!(visited.len(), unique.len(), "a tile was visited twice");
    assert_eq!(unique, expected);

    let plan = GroupTilePlan::new(p, offsets, tile);
    assert_eq!(plan.total_tiles(), expected.len());
    for (context, tiles) in per_context.iter().enumerate() {
        assert!(tiles.iter().all(|t| t.global_index % grid.num_units() == context));
        let walked: Vec<WorkTile> = tiles.iter().map(|t| t.tile).collect();
        assert_eq!(walked, plan.tiles_for_context(context, grid));
    }
}

#[test]
fn zero_sized_groups_contribute_no_tiles() {
    let sizes = [0usize, 250, 0, 0, 300, 1];
    let p = problem(ShapeClass::TwoDThreeD, sizes.len(), 551, 96, 64);
    let offsets = GroupOffsets::new(&cumulative(&sizes), sizes.len(), 551).unwrap();
    let tile = TileShape::new(128, 64, 64);
    let extents: Vec<_> = sizes.iter().map(|&rows| (rows, 96)).collect();
    assert_complete(&p, Some(&offsets), tile, 5, expected_tiles(&extents, tile));
}

#[test]
fn n_split_groups_tile_their_columns() {
    let sizes = [33usize, 0, 64, 200];
    let p = problem(ShapeClass::ThreeDTwoD, sizes.len(), 70, 297, 64);
    let offsets = GroupOffsets::new(&cumulative(&sizes), sizes.len(), 297).unwrap();
    let tile = TileShape::new(64, 64, 64);
    let extents: Vec<_> = sizes.iter().map(|&cols| (70, cols)).collect();
    assert_complete(&p, Some(&offsets), tile, 3, expected_tiles(&extents, tile));
}

proptest! {
    #[test]
    fn every_tile_is_visited_exactly_once(
        sizes in prop::collection::vec(0usize..300, 1..8),
        n in 1usize..300,
        bm_pow in 5u32..8,
        bn_pow in 5u32..9,
        units in 1usize..40,
    ) {
        let total: usize = sizes.iter().sum();
        let p = problem(ShapeClass::TwoDThreeD, sizes.len(), total, n, 64);
        let offsets = GroupOffsets::new(&cumulative(&sizes), sizes.len(), total).unwrap();
        let tile = TileShape::new(1 << bm_pow, 1 << bn_pow, 64);
        let extents: Vec<_> = sizes.iter().map(|&rows| (rows, n)).collect();
        assert_complete(&p, Some(&offsets), tile, units, expected_tiles(&extents, tile));
    }

    #[test]
    fn static_groups_are_fully_tiled(
        g in 1usize..6,
        m in 1usize..300,
        n in 1usize..300,
        units in 1usize..20,
    ) {
        let p = problem(ShapeClass::ThreeDThreeD, g, m, n, 64);
        let tile = TileShape::new(64, 128, 64);
        let extents = vec![(m, n); g];
        assert_complete(&p, None, tile, units, expected_tiles(&extents, tile));
    }

    #[test]
    fn decode_is_m_major(m in 1usize..600, n in 1usize..600) {
        let p = problem(ShapeClass::ThreeDThreeD, 1, m, n, 64);
        let tile = TileShape::new(64, 64, 64);
        let per_context = simulate_all_contexts(&p, None, tile, LaunchGrid::new(1));
        let num_m_tiles = m.div_ceil(64);
        for scheduled in &per_context[0] {
            prop_assert_eq!(scheduled.tile.tile_m, scheduled.global_index % num_m_tiles);
            prop_assert_eq!(scheduled.tile.tile_n, scheduled.global_index / num_m_tiles);
        }
    }
}
