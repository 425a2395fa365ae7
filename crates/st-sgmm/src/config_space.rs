// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Kernel configuration search space for the persistent grouped GEMM.
//!
//! A [`ConfigTemplate`] holds the candidate values for every knob and yields
//! their Cartesian product lazily, last knob fastest, so the generated order is
//! stable across runs. Two templates exist, one per [`HardwareFamily`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Hardware families with distinct resource quanta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareFamily {
    /// CUDA-style devices: staged A and B tiles both live in shared memory.
    Generic,
    /// ROCm-style devices: only the B tile is staged; wave occupancy is tunable.
    Alternate,
}

impl HardwareFamily {
    /// Tile floor below which the M/N "oversized tile" checks never fire.
    pub fn min_tile(self) -> u32 {
        match self {
            HardwareFamily::Generic => 64,
            HardwareFamily::Alternate => 32,
        }
    }
}

impl From<spiral_config::FamilyOverride> for HardwareFamily {
    fn from(value: spiral_config::FamilyOverride) -> Self {
        match value {
            spiral_config::FamilyOverride::Generic => HardwareFamily::Generic,
            spiral_config::FamilyOverride::Alternate => HardwareFamily::Alternate,
        }
    }
}

pub const WAVES_PER_EU: &str = "waves_per_eu";
pub const MATRIX_INSTR_NONKDIM: &str = "matrix_instr_nonkdim";

/// Consumer groups assumed when a config does not specify any: no warp
/// specialization.
pub const DEFAULT_CONSUMER_GROUPS: u32 = 0;

/// Consumer groups the kernel body is compiled with when the config does not
/// opt into warp specialization.
pub const KERNEL_CONSUMER_GROUPS: u32 = 1;

/// One point of the search space. Immutable once generated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelConfig {
    pub family: HardwareFamily,
    pub block_m: u32,
    pub block_n: u32,
    pub block_k: u32,
    pub num_stages: u32,
    pub num_warps: u32,
    /// Explicit warp-specialization request. `None` means
    /// [`DEFAULT_CONSUMER_GROUPS`]; the generated families leave it unset.
    pub num_consumer_groups: Option<u32>,
    pub vendor_extra: BTreeMap<String, u32>,
}

impl KernelConfig {
    pub fn consumer_groups(&self) -> u32 {
        self.num_consumer_groups.unwrap_or(DEFAULT_CONSUMER_GROUPS)
    }

    pub fn is_warp_specialized(&self) -> bool {
        self.consumer_groups() >= 1
    }

    /// Value of the kernel's `NUM_CONSUMER_GROUPS` constant.
    pub fn kernel_consumer_groups(&self) -> u32 {
        self.consumer_groups().max(KERNEL_CONSUMER_GROUPS)
    }

    pub fn waves_per_eu(&self) -> Option<u32> {
        self.vendor_extra.get(WAVES_PER_EU).copied()
    }

    pub fn matrix_instr_nonkdim(&self) -> Option<u32> {
        self.vendor_extra.get(MATRIX_INSTR_NONKDIM).copied()
    }

    /// Short identifier used in kernel names and benchmark tables.
    pub fn label(&self) -> String {
        let mut label = format!(
            "BM{}_BN{}_BK{}_S{}_W{}_CG{}",
            self.block_m,
            self.block_n,
            self.block_k,
            self.num_stages,
            self.num_warps,
            self.consumer_groups()
        );
        for (key, value) in &self.vendor_extra {
            label.push_str(&format!("_{key}{value}"));
        }
        label
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Candidate values per knob. Warps are paired with an optional waves-per-EU
/// hint because the alternate family ties the two together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigTemplate {
    family: HardwareFamily,
    block_m: Vec<u32>,
    block_n: Vec<u32>,
    block_k: Vec<u32>,
    stages: Vec<u32>,
    warps: Vec<(u32, Option<u32>)>,
    matrix_instr: Vec<Option<u32>>,
    consumer_groups: Option<u32>,
}

impl ConfigTemplate {
    pub fn generic() -> Self {
        Self {
            family: HardwareFamily::Generic,
            block_m: vec![64, 128],
            block_n: vec![64, 128, 256],
            block_k: vec![64, 128, 256],
            stages: vec![3, 4],
            warps: vec![(4, None), (8, None)],
            matrix_instr: vec![None],
            consumer_groups: None,
        }
    }

    pub fn alternate() -> Self {
        Self {
            family: HardwareFamily::Alternate,
            block_m: vec![32, 64, 128],
            block_n: vec![32, 64, 128, 256],
            block_k: vec![128, 256],
            stages: vec![1, 2],
            warps: vec![(4, Some(1)), (8, Some(2)), (16, Some(4))],
            matrix_instr: vec![Some(16)],
            consumer_groups: None,
        }
    }

    pub fn for_family(family: HardwareFamily) -> Self {
        match family {
            HardwareFamily::Generic => Self::generic(),
            HardwareFamily::Alternate => Self::alternate(),
        }
    }

    pub fn with_block_m<I: IntoIterator<Item = u32>>(mut self, values: I) -> Self {
        self.block_m = values.into_iter().collect();
        self
    }

    pub fn with_block_n<I: IntoIterator<Item = u32>>(mut self, values: I) -> Self {
        self.block_n = values.into_iter().collect();
        self
    }

    pub fn with_block_k<I: IntoIterator<Item = u32>>(mut self, values: I) -> Self {
        self.block_k = values.into_iter().collect();
        self
    }

    pub fn with_stages<I: IntoIterator<Item = u32>>(mut self, values: I) -> Self {
        self.stages = values.into_iter().collect();
        self
    }

    pub fn with_warps<I: IntoIterator<Item = (u32, Option<u32>)>>(mut self, values: I) -> Self {
        self.warps = values.into_iter().collect();
        self
    }

    pub fn with_consumer_groups(mut self, groups: Option<u32>) -> Self {
        self.consumer_groups = groups;
        self
    }

    pub fn family(&self) -> HardwareFamily {
        self.family
    }

    pub fn is_empty(&self) -> bool {
        self.block_m.is_empty()
            || self.block_n.is_empty()
            || self.block_k.is_empty()
            || self.stages.is_empty()
            || self.warps.is_empty()
            || self.matrix_instr.is_empty()
    }

    pub fn len(&self) -> usize {
        self.block_m.len()
            * self.block_n.len()
            * self.block_k.len()
            * self.stages.len()
            * self.warps.len()
            * self.matrix_instr.len()
    }

    pub fn iter(&self) -> ConfigIter<'_> {
        ConfigIter::new(self)
    }
}

/// Every configuration of `family`, in template order.
pub fn generate_configs(family: HardwareFamily) -> Vec<KernelConfig> {
    ConfigTemplate::for_family(family).iter().collect()
}

pub struct ConfigIter<'a> {
    template: &'a ConfigTemplate,
    indices: [usize; 6],
    finished: bool,
}

impl<'a> ConfigIter<'a> {
    fn new(template: &'a ConfigTemplate) -> Self {
        Self {
            template,
            indices: [0; 6],
            finished: template.is_empty(),
        }
    }

    fn dims(&self) -> [usize; 6] {
        [
            self.template.block_m.len(),
            self.template.block_n.len(),
            self.template.block_k.len(),
            self.template.stages.len(),
            self.template.warps.len(),
            self.template.matrix_instr.len(),
        ]
    }

    fn advance(&mut self) {
        let dims = self.dims();
        for dim in (0..self.indices.len()).rev() {
            if self.indices[dim] + 1 < dims[dim] {
                self.indices[dim] += 1;
                for reset in dim + 1..self.indices.len() {
                    self.indices[reset] = 0;
                }
                return;
            }
        }
        self.finished = true;
    }
}

impl Iterator for ConfigIter<'_> {
    type Item = KernelConfig;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let t = self.template;
        let (num_warps, waves) = t.warps[self.indices[4]];
        let mut vendor_extra = BTreeMap::new();
        if let Some(waves) = waves {
            vendor_extra.insert(WAVES_PER_EU.to_string(), waves);
        }
        if let Some(nonkdim) = t.matrix_instr[self.indices[5]] {
            vendor_extra.insert(MATRIX_INSTR_NONKDIM.to_string(), nonkdim);
        }
        let config = KernelConfig {
            family: t.family,
            block_m: t.block_m[self.indices[0]],
            block_n: t.block_n[self.indices[1]],
            block_k: t.block_k[self.indices[2]],
            num_stages: t.stages[self.indices[3]],
            num_warps,
            num_consumer_groups: t.consumer_groups,
            vendor_extra,
        };
        self.advance();
        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_family_is_full_cross_product() {
        let configs = generate_configs(HardwareFamily::Generic);
        assert_eq!(configs.len(), 2 * 3 * 3 * 2 * 2);
        assert!(configs.iter().all(|c| !c.is_warp_specialized()));
        assert!(configs.iter().all(|c| c.kernel_consumer_groups() == 1));
        assert!(configs.iter().all(|c| c.vendor_extra.is_empty()));
        let first = &configs[0];
        assert_eq!(
            (first.block_m, first.block_n, first.block_k, first.num_stages, first.num_warps),
            (64, 64, 64, 3, 4)
        );
        let last = configs.last().unwrap();
        assert_eq!(
            (last.block_m, last.block_n, last.block_k, last.num_stages, last.num_warps),
            (128, 256, 256, 4, 8)
        );
    }

    #[test]
    fn alternate_family_pairs_warps_with_waves() {
        let configs = generate_configs(HardwareFamily::Alternate);
        assert_eq!(configs.len(), 3 * 4 * 2 * 2 * 3);
        for config in &configs {
            let expected_waves = match config.num_warps {
                4 => 1,
                8 => 2,
                16 => 4,
                other => panic!("unexpected warp count {other}"),
            };
            assert_eq!(config.waves_per_eu(), Some(expected_waves));
            assert_eq!(config.matrix_instr_nonkdim(), Some(16));
            assert_eq!(config.family, HardwareFamily::Alternate);
        }
    }

    #[test]
    fn generation_is_idempotent() {
        for family in [HardwareFamily::Generic, HardwareFamily::Alternate] {
            assert_eq!(generate_configs(family), generate_configs(family));
        }
    }

    #[test]
    fn configs_are_unique() {
        let configs = generate_configs(HardwareFamily::Alternate);
        let unique: std::collections::HashSet<_> = configs.iter().collect();
        assert_eq!(unique.len(), configs.len());
    }

    #[test]
    fn empty_knob_yields_nothing() {
        let template = ConfigTemplate::generic().with_block_k(Vec::<u32>::new());
        assert!(template.is_empty());
        assert_eq!(template.iter().count(), 0);
    }

    #[test]
    fn missing_consumer_groups_means_not_specialized() {
        let config = ConfigTemplate::generic().iter().next().unwrap();
        assert_eq!(config.num_consumer_groups, None);
        assert_eq!(config.consumer_groups(), DEFAULT_CONSUMER_GROUPS);
        assert!(!config.is_warp_specialized());
        assert_eq!(config.label(), "BM64_BN64_BK64_S3_W4_CG0");

        let specialized = ConfigTemplate::generic()
            .with_consumer_groups(Some(2))
            .iter()
            .next()
            .unwrap();
        assert!(specialized.is_warp_specialized());
        assert_eq!(specialized.kernel_consumer_groups(), 2);
        assert_eq!(specialized.label(), "BM64_BN64_BK64_S3_W4_CG2");
    }
}
