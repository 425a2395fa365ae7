// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Feasibility pruning of kernel configurations.
//!
//! Checks run in a fixed order and stop at the first failure. An empty
//! survivor set is a valid outcome: the caller falls back to the reference.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config_space::{HardwareFamily, KernelConfig};
use crate::problem::ProblemShape;

/// Device resources the pruner checks against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareLimits {
    pub max_shared_memory_bytes: usize,
    pub num_compute_units: usize,
}

/// Why a configuration was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruneReason {
    SharedMemory { required: usize, available: usize },
    MTileOversized { block_m: u32, m_per_group: usize },
    MTileUndersized { block_m: u32, m_per_group: usize },
    NTileOversized { block_n: u32, work_tiles: usize },
    NTileUndersized { block_n: u32, work_tiles: usize },
    WarpCount { num_warps: u32 },
    ConsumerPartition { m_slice: u32, n_slice: u32 },
}

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PruneReason::SharedMemory {
                required,
                available,
            } => write!(f, "needs {required} B of shared memory, {available} B available"),
            PruneReason::MTileOversized {
                block_m,
                m_per_group,
            } => write!(f, "BLOCK_M={block_m} exceeds twice M_per_group={m_per_group}"),
            PruneReason::MTileUndersized {
                block_m,
                m_per_group,
            } => write!(f, "BLOCK_M={block_m} below half of M_per_group={m_per_group}"),
            PruneReason::NTileOversized {
                block_n,
                work_tiles,
            } => write!(f, "BLOCK_N={block_n} leaves {work_tiles} work items for the device"),
            PruneReason::NTileUndersized {
                block_n,
                work_tiles,
            } => write!(f, "BLOCK_N={block_n} oversubscribes with {work_tiles} work items"),
            PruneReason::WarpCount { num_warps } => {
                write!(f, "warp specialization needs 4 warps, got {num_warps}")
            }
            PruneReason::ConsumerPartition { m_slice, n_slice } => write!(
                f,
                "consumer slices too small (m_slice={m_slice}, n_slice={n_slice})"
            ),
        }
    }
}

/// Shared memory needed to stage `num_stages` tiles. The alternate family only
/// stages the B tile.
pub fn shared_memory_bytes(config: &KernelConfig, dtype_size: usize) -> usize {
    let bk = config.block_k as usize;
    let stages = config.num_stages as usize;
    let staged = match config.family {
        HardwareFamily::Generic => (config.block_m + config.block_n) as usize,
        HardwareFamily::Alternate => config.block_n as usize,
    };
    staged * bk * stages * dtype_size
}

/// Runs every check against one configuration.
pub fn check(
    config: &KernelConfig,
    problem: &ProblemShape,
    limits: &HardwareLimits,
) -> Result<(), PruneReason> {
    let required = shared_memory_bytes(config, problem.dtype.size_bytes());
    if required > limits.max_shared_memory_bytes {
        return Err(PruneReason::SharedMemory {
            required,
            available: limits.max_shared_memory_bytes,
        });
    }

    let m_per_group = problem.m_per_group();
    let n_per_group = problem.n_per_group();
    let warp_specialized = config.is_warp_specialized();
    let floor = config.family.min_tile();
    let block_m = config.block_m as usize;
    let block_n = config.block_n as usize;

    if !warp_specialized && config.block_m > floor && block_m > m_per_group * 2 {
        return Err(PruneReason::MTileOversized {
            block_m: config.block_m,
            m_per_group,
        });
    }
    if config.block_m < 128 && block_m < m_per_group / 2 {
        return Err(PruneReason::MTileUndersized {
            block_m: config.block_m,
            m_per_group,
        });
    }

    let n_tiles = n_per_group / block_n;
    let work_tiles = problem.g * m_per_group * n_tiles;
    if !warp_specialized && config.block_n > floor && work_tiles < limits.num_compute_units {
        return Err(PruneReason::NTileOversized {
            block_n: config.block_n,
            work_tiles,
        });
    }
    if config.block_n < 128 && work_tiles > 2 * limits.num_compute_units {
        return Err(PruneReason::NTileUndersized {
            block_n: config.block_n,
            work_tiles,
        });
    }

    if warp_specialized {
        if config.num_warps != 4 {
            return Err(PruneReason::WarpCount {
                num_warps: config.num_warps,
            });
        }
        let groups = config.consumer_groups();
        let m_slice = config.block_m / groups;
        let n_slice = config.block_n / groups;
        if m_slice < 64 && n_slice < 256 {
            return Err(PruneReason::ConsumerPartition { m_slice, n_slice });
        }
    }
    Ok(())
}

/// Verdict for every configuration, in input order.
pub fn prune_with_reasons<'a>(
    configs: &'a [KernelConfig],
    problem: &ProblemShape,
    limits: &HardwareLimits,
) -> Vec<(&'a KernelConfig, Result<(), PruneReason>)> {
    configs
        .iter()
        .map(|config| (config, check(config, problem, limits)))
        .collect()
}

/// Configurations that pass every check, in input order.
pub fn prune(
    configs: Vec<KernelConfig>,
    problem: &ProblemShape,
    limits: &HardwareLimits,
) -> Vec<KernelConfig> {
    let total = configs.len();
    let survivors: Vec<KernelConfig> = configs
        .into_iter()
        .filter(|config| match check(config, problem, limits) {
            Ok(()) => true,
            Err(reason) => {
                debug!(config = %config, %reason, "pruned kernel config");
                false
            }
        })
        .collect();
    debug!(total, kept = survivors.len(), "config pruning finished");
    survivors
}
