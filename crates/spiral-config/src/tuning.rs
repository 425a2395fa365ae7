use std::sync::OnceLock;
use std::time::Duration;

/// Forces the configuration family used to generate kernel candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FamilyOverride {
    Generic,
    Alternate,
}

/// Autotuning knobs shared by every grouped GEMM round in the process.
#[derive(Clone, Debug, PartialEq)]
pub struct TuningConfig {
    /// Untimed launches per candidate before measurement starts.
    pub warmup: u32,
    /// Timed launches per candidate; the median is the candidate's score.
    pub repeats: u32,
    /// Wall-clock budget for a whole round. Candidates not started before the
    /// budget runs out are skipped.
    pub budget: Option<Duration>,
    /// Whether the reference kernel races against the generated ones.
    pub include_reference: bool,
    /// Family override; `None` follows the device.
    pub family: Option<FamilyOverride>,
    /// Override of the persistent launch width (execution contexts).
    pub num_units: Option<usize>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            warmup: 3,
            repeats: 10,
            budget: None,
            include_reference: true,
            family: None,
            num_units: None,
        }
    }
}

/// A tuning variable was present but could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for {key}: expected {expected}")]
pub struct TuningEnvError {
    pub key: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl TuningConfig {
    /// Strict parse of the `SPIRAL_SGMM_*` variables.
    pub fn try_from_env() -> Result<Self, TuningEnvError> {
        let defaults = Self::default();
        let warmup = parse_var("SPIRAL_SGMM_WARMUP", "an unsigned integer", |raw| {
            raw.parse::<u32>().ok()
        })?
        .unwrap_or(defaults.warmup);
        let repeats = parse_var("SPIRAL_SGMM_REPEATS", "a positive integer", |raw| {
            raw.parse::<u32>().ok().filter(|value| *value > 0)
        })?
        .unwrap_or(defaults.repeats);
        let budget = parse_var("SPIRAL_SGMM_BUDGET_MS", "milliseconds", |raw| {
            raw.parse::<u64>().ok().map(Duration::from_millis)
        })?;
        let include_reference = parse_var("SPIRAL_SGMM_REFERENCE", "a boolean", parse_flag)?
            .unwrap_or(defaults.include_reference);
        let family = parse_var("SPIRAL_SGMM_FAMILY", "generic or alternate", |raw| {
            match raw.to_ascii_lowercase().as_str() {
                "generic" | "nv" | "cuda" => Some(FamilyOverride::Generic),
                "alternate" | "amd" | "hip" | "rocm" => Some(FamilyOverride::Alternate),
                _ => None,
            }
        })?;
        let num_units = parse_var("SPIRAL_SGMM_NUM_UNITS", "a positive integer", |raw| {
            raw.parse::<usize>().ok().filter(|value| *value > 0)
        })?;

        Ok(Self {
            warmup,
            repeats,
            budget,
            include_reference,
            family,
            num_units,
        })
    }

    /// Lenient variant of [`TuningConfig::try_from_env`]: malformed variables
    /// are reported and replaced by the defaults.
    pub fn from_env() -> Self {
        match Self::try_from_env() {
            Ok(cfg) => cfg,
            Err(err) => {
                ::tracing::warn!("{err}; using default tuning configuration");
                Self::default()
            }
        }
    }
}

fn parse_var<T>(
    key: &'static str,
    expected: &'static str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<Option<T>, TuningEnvError> {
    let raw = match std::env::var(key) {
        Ok(raw) => raw,
        Err(_) => return Ok(None),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    parse(trimmed).map(Some).ok_or_else(|| TuningEnvError {
        key,
        value: raw.clone(),
        expected,
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw {
        "1" | "true" | "True" | "TRUE" | "on" | "ON" => Some(true),
        "0" | "false" | "False" | "FALSE" | "off" | "OFF" => Some(false),
        _ => None,
    }
}

static CONFIG: OnceLock<TuningConfig> = OnceLock::new();

/// Returns the lazily initialised process configuration.
pub fn config() -> &'static TuningConfig {
    CONFIG.get_or_init(TuningConfig::from_env)
}

/// Installs `cfg` unless a configuration was already initialised. Intended for tests.
pub fn configure(cfg: TuningConfig) -> &'static TuningConfig {
    CONFIG.get_or_init(|| cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::{Mutex, OnceLock};

    const KEYS: [&str; 6] = [
        "SPIRAL_SGMM_WARMUP",
        "SPIRAL_SGMM_REPEATS",
        "SPIRAL_SGMM_BUDGET_MS",
        "SPIRAL_SGMM_REFERENCE",
        "SPIRAL_SGMM_FAMILY",
        "SPIRAL_SGMM_NUM_UNITS",
    ];

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut all: Vec<(&str, Option<&str>)> = KEYS.iter().map(|key| (*key, None)).collect();
        for (key, value) in vars {
            if let Some(slot) = all.iter_mut().find(|(k, _)| k == key) {
                slot.1 = *value;
            }
        }

        let snapshot: Vec<(String, Option<String>)> = all
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn unset_environment_yields_defaults() {
        with_env(&[], || {
            let cfg = TuningConfig::try_from_env().unwrap();
            assert_eq!(cfg, TuningConfig::default());
        });
    }

    #[test]
    fn explicit_values_are_parsed() {
        with_env(
            &[
                ("SPIRAL_SGMM_WARMUP", Some("0")),
                ("SPIRAL_SGMM_REPEATS", Some("25")),
                ("SPIRAL_SGMM_BUDGET_MS", Some("1500")),
                ("SPIRAL_SGMM_REFERENCE", Some("off")),
                ("SPIRAL_SGMM_FAMILY", Some("HIP")),
                ("SPIRAL_SGMM_NUM_UNITS", Some("304")),
            ],
            || {
                let cfg = TuningConfig::try_from_env().unwrap();
                assert_eq!(cfg.warmup, 0);
                assert_eq!(cfg.repeats, 25);
                assert_eq!(cfg.budget, Some(Duration::from_millis(1500)));
                assert!(!cfg.include_reference);
                assert_eq!(cfg.family, Some(FamilyOverride::Alternate));
                assert_eq!(cfg.num_units, Some(304));
            },
        );
    }

    #[test]
    fn zero_repeats_is_rejected() {
        with_env(&[("SPIRAL_SGMM_REPEATS", Some("0"))], || {
            let err = TuningConfig::try_from_env().unwrap_err();
            assert_eq!(err.key, "SPIRAL_SGMM_REPEATS");
        });
    }

    #[test]
    fn configured_value_is_shared_by_the_process() {
        // No other test in this crate touches the process-wide value.
        let cfg = TuningConfig {
            repeats: 7,
            family: Some(FamilyOverride::Generic),
            ..TuningConfig::default()
        };
        let installed = configure(cfg.clone());
        assert_eq!(installed, &cfg);
        assert!(std::ptr::eq(config(), installed));
        // Later installs keep the first value.
        assert_eq!(configure(TuningConfig::default()), &cfg);
    }

    #[test]
    fn lenient_parse_falls_back_to_defaults() {
        with_env(&[("SPIRAL_SGMM_FAMILY", Some("tpu"))], || {
            assert!(TuningConfig::try_from_env().is_err());
            assert_eq!(TuningConfig::from_env(), TuningConfig::default());
        });
    }
}
