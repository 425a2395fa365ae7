// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-wide invocation counters, grouped by name.

use std::collections::BTreeMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

pub const MM_INFO_GROUP: &str = "aten_mm_info";
pub const SCALED_GROUPED_MM_KEY: &str = "aten._scaled_grouped_mm.default";

static COUNTERS: Lazy<Counters> = Lazy::new(Counters::default);

#[derive(Debug, Default)]
pub struct Counters {
    groups: Mutex<BTreeMap<String, BTreeMap<String, u64>>>,
}

impl Counters {
    pub fn increment(&self, group: &str, key: &str) -> u64 {
        let mut groups = self
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = groups
            .entry(group.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0);
        *slot += 1;
        *slot
    }

    pub fn get(&self, group: &str, key: &str) -> u64 {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(group)
            .and_then(|entries| entries.get(key))
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

/// Global registry.
pub fn counters() -> &'static Counters {
    &COUNTERS
}
