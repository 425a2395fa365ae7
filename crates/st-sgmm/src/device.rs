// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Device capability queries used to size and gate the generated kernels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config_space::HardwareFamily;
use crate::prune::HardwareLimits;

/// What the tuner needs to know about the target device.
pub trait DeviceQuery: Send + Sync {
    /// Shared memory available to one compute unit, in bytes.
    fn shared_memory_per_unit(&self) -> usize;
    fn num_compute_units(&self) -> usize;
    /// Whether tensor-descriptor loads are available.
    fn supports_tensor_descriptors(&self) -> bool;
    fn family(&self) -> HardwareFamily;

    fn limits(&self) -> HardwareLimits {
        HardwareLimits {
            max_shared_memory_bytes: self.shared_memory_per_unit(),
            num_compute_units: self.num_compute_units(),
        }
    }
}

/// Device with explicitly provided capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticDevice {
    pub shared_memory_bytes: usize,
    pub compute_units: usize,
    pub tensor_descriptors: bool,
    pub family: HardwareFamily,
}

impl DeviceQuery for StaticDevice {
    fn shared_memory_per_unit(&self) -> usize {
        self.shared_memory_bytes
    }

    fn num_compute_units(&self) -> usize {
        self.compute_units
    }

    fn supports_tensor_descriptors(&self) -> bool {
        self.tensor_descriptors
    }

    fn family(&self) -> HardwareFamily {
        self.family
    }
}

/// Named hardware identity with capabilities.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub vendor: String,
    pub name: String,
    /// Shared memory per compute unit expressed in kilobytes.
    pub shared_kb: u32,
    pub compute_units: u32,
    pub tensor_descriptors: bool,
    pub family: HardwareFamily,
}

impl DeviceProfile {
    /// Hopper-class part: 227 KiB of shared memory, 132 SMs.
    pub fn hopper() -> Self {
        Self {
            vendor: "nvidia".into(),
            name: "sm90".into(),
            shared_kb: 227,
            compute_units: 132,
            tensor_descriptors: true,
            family: HardwareFamily::Generic,
        }
    }

    /// CDNA3-class part: 64 KiB of LDS, 304 CUs.
    pub fn cdna3() -> Self {
        Self {
            vendor: "amd".into(),
            name: "gfx942".into(),
            shared_kb: 64,
            compute_units: 304,
            tensor_descriptors: true,
            family: HardwareFamily::Alternate,
        }
    }

    /// Host fallback: no descriptor support, so only the reference is used.
    pub fn host() -> Self {
        Self {
            vendor: "host".into(),
            name: "cpu".into(),
            shared_kb: 64,
            compute_units: std::thread::available_parallelism().map_or(1, |n| n.get() as u32),
            tensor_descriptors: false,
            family: HardwareFamily::Generic,
        }
    }

    /// Profile named by `SPIRAL_SGMM_DEVICE` (`sm90`, `gfx942`, `host`), with
    /// the compute-unit count overridable through `SPIRAL_SGMM_DEVICE_UNITS`.
    pub fn from_env() -> Self {
        let mut profile = match std::env::var("SPIRAL_SGMM_DEVICE")
            .ok()
            .map(|value| value.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("sm90") | Some("hopper") | Some("nvidia") => Self::hopper(),
            Some("gfx942") | Some("mi300x") | Some("amd") | Some("rocm") => Self::cdna3(),
            _ => Self::host(),
        };
        if let Some(units) = std::env::var("SPIRAL_SGMM_DEVICE_UNITS")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|&units| units > 0)
        {
            profile.compute_units = units;
        }
        profile
    }

    fn encode_component(value: &str) -> String {
        value
            .chars()
            .map(|ch| match ch {
                'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' => ch,
                ' ' => '-',
                _ => '_',
            })
            .collect::<String>()
    }

    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            Self::encode_component(&self.vendor),
            Self::encode_component(&self.name),
            self.shared_kb,
            self.compute_units,
            if self.tensor_descriptors { "tma" } else { "ptr" }
        )
    }
}

impl DeviceQuery for DeviceProfile {
    fn shared_memory_per_unit(&self) -> usize {
        self.shared_kb as usize * 1024
    }

    fn num_compute_units(&self) -> usize {
        self.compute_units as usize
    }

    fn supports_tensor_descriptors(&self) -> bool {
        self.tensor_descriptors
    }

    fn family(&self) -> HardwareFamily {
        self.family
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
