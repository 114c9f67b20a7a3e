//! Runtime configuration.
//!
//! Everything here is resolved once at process startup and then shared read-only, typically as
//! `Arc<CoreConfig>`. Validation happens at construction: a `CoreConfig` or `ObfuscationPolicy`
//! that exists is one that is safe to use for every query, so configuration mistakes surface at
//! startup rather than as per-query failures.

use crate::constants::{DEFAULT_CACHE_LIMIT, MAX_LATITUDE, MAX_LONGITUDE};
use crate::responder::NetworkIdentity;
use crate::{CohortError, CohortResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Low-cell masking settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LowCellMasking {
    pub enabled: bool,
    pub threshold: i64,
}

/// Noise settings. Shifts are drawn from the half-open range `[lower_bound, upper_bound)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Noise {
    pub enabled: bool,
    pub lower_bound: i32,
    pub upper_bound: i32,
}

impl Noise {
    /// Largest absolute shift this range can produce, reported as the count's `plus_minus`.
    pub fn plus_minus(&self) -> i64 {
        i64::from(self.lower_bound)
            .abs()
            .max(i64::from(self.upper_bound).abs())
    }
}

/// Validated cohort obfuscation policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ObfuscationPolicy {
    enabled: bool,
    low_cell_masking: LowCellMasking,
    noise: Noise,
}

impl ObfuscationPolicy {
    /// Create a policy, rejecting settings that could not be applied to every query.
    ///
    /// # Errors
    ///
    /// Returns [`CohortError::InvalidConfig`] if:
    /// - the low-cell threshold is negative,
    /// - noise is enabled and `[lower_bound, upper_bound)` is empty or contains only zero.
    pub fn new(enabled: bool, low_cell_masking: LowCellMasking, noise: Noise) -> CohortResult<Self> {
        if low_cell_masking.threshold < 0 {
            return Err(CohortError::InvalidConfig(format!(
                "low cell masking threshold cannot be negative (got {})",
                low_cell_masking.threshold
            )));
        }

        if noise.enabled {
            if noise.lower_bound >= noise.upper_bound {
                return Err(CohortError::InvalidConfig(format!(
                    "noise lower_bound ({}) must be less than upper_bound ({})",
                    noise.lower_bound, noise.upper_bound
                )));
            }
            if noise.lower_bound == 0 && noise.upper_bound == 1 {
                return Err(CohortError::InvalidConfig(
                    "noise range [0, 1) contains no non-zero shift".into(),
                ));
            }
        }

        Ok(Self {
            enabled,
            low_cell_masking,
            noise,
        })
    }

    /// A policy that leaves every count untouched.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            low_cell_masking: LowCellMasking::default(),
            noise: Noise::default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn low_cell_masking(&self) -> LowCellMasking {
        self.low_cell_masking
    }

    pub fn noise(&self) -> Noise {
        self.noise
    }
}

/// Where raw counts are obfuscated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObfuscationSite {
    /// Responders report raw counts and the aggregator applies the policy.
    #[default]
    Aggregator,
    /// Responders apply the policy themselves; counts are stored as received.
    Responder,
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    policy: ObfuscationPolicy,
    obfuscation_site: ObfuscationSite,
    cache_limit: u64,
    low_cell_masking_threshold: i64,
    responders: Vec<NetworkIdentity>,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// `low_cell_masking_threshold` is the aggregate-level threshold used to gate visualisations.
    /// When `None` it follows the policy: the masking threshold if masking is enabled, else 0.
    pub fn new(
        policy: ObfuscationPolicy,
        obfuscation_site: ObfuscationSite,
        cache_limit: u64,
        low_cell_masking_threshold: Option<i64>,
        responders: Vec<NetworkIdentity>,
    ) -> CohortResult<Self> {
        let low_cell_masking_threshold = match low_cell_masking_threshold {
            Some(threshold) if threshold < 0 => {
                return Err(CohortError::InvalidConfig(format!(
                    "low_cell_masking_threshold cannot be negative (got {threshold})"
                )));
            }
            Some(threshold) => threshold,
            None if policy.enabled() && policy.low_cell_masking().enabled => {
                policy.low_cell_masking().threshold
            }
            None => 0,
        };

        validate_responders(&responders)?;

        Ok(Self {
            policy,
            obfuscation_site,
            cache_limit,
            low_cell_masking_threshold,
            responders,
        })
    }

    /// Parse and validate a configuration document.
    ///
    /// Unknown keys are rejected and parse errors name the failing field path
    /// (e.g. `obfuscation.noise.lower_bound`).
    pub fn from_yaml_str(text: &str) -> CohortResult<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(text);
        let wire: ConfigWire = serde_path_to_error::deserialize(deserializer).map_err(|err| {
            let path = err.path().to_string();
            CohortError::ConfigParse {
                path: if path.is_empty() { "<root>".into() } else { path },
                message: err.into_inner().to_string(),
            }
        })?;

        let policy = ObfuscationPolicy::new(
            wire.obfuscation.enabled,
            wire.obfuscation.low_cell_masking,
            wire.obfuscation.noise,
        )?;

        Self::new(
            policy,
            wire.obfuscation.site,
            wire.cache_limit,
            wire.low_cell_masking_threshold,
            wire.responders,
        )
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> CohortResult<Self> {
        let text = std::fs::read_to_string(path).map_err(CohortError::ConfigRead)?;
        Self::from_yaml_str(&text)
    }

    pub fn policy(&self) -> &ObfuscationPolicy {
        &self.policy
    }

    pub fn obfuscation_site(&self) -> ObfuscationSite {
        self.obfuscation_site
    }

    pub fn cache_limit(&self) -> u64 {
        self.cache_limit
    }

    pub fn low_cell_masking_threshold(&self) -> i64 {
        self.low_cell_masking_threshold
    }

    pub fn responders(&self) -> &[NetworkIdentity] {
        &self.responders
    }
}

/// Resolve the configuration file path from an optional environment value.
///
/// The value must be present and non-blank; there is no built-in default because running
/// without a deliberate obfuscation policy is not allowed.
pub fn config_path_from_env_value(value: Option<String>) -> CohortResult<PathBuf> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            CohortError::InvalidConfig(format!(
                "{} must name a configuration file",
                crate::constants::CONFIG_PATH_ENV
            ))
        })
}

fn validate_responders(responders: &[NetworkIdentity]) -> CohortResult<()> {
    let mut seen = HashSet::new();
    for responder in responders {
        if !seen.insert(responder.id) {
            return Err(CohortError::DuplicateResponder(responder.id));
        }
        if let Some(latitude) = responder.latitude {
            if !(-MAX_LATITUDE..=MAX_LATITUDE).contains(&latitude) {
                return Err(CohortError::InvalidConfig(format!(
                    "responder {} latitude {latitude} is out of range",
                    responder.id
                )));
            }
        }
        if let Some(longitude) = responder.longitude {
            if !(-MAX_LONGITUDE..=MAX_LONGITUDE).contains(&longitude) {
                return Err(CohortError::InvalidConfig(format!(
                    "responder {} longitude {longitude} is out of range",
                    responder.id
                )));
            }
        }
    }

    if !responders.iter().any(|r| r.enabled) {
        return Err(CohortError::InvalidConfig(
            "at least one responder must be configured and enabled".into(),
        ));
    }

    Ok(())
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigWire {
    obfuscation: ObfuscationWire,
    #[serde(default = "default_cache_limit")]
    cache_limit: u64,
    #[serde(default)]
    low_cell_masking_threshold: Option<i64>,
    responders: Vec<NetworkIdentity>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ObfuscationWire {
    enabled: bool,
    #[serde(default)]
    site: ObfuscationSite,
    #[serde(default)]
    low_cell_masking: LowCellMasking,
    #[serde(default)]
    noise: Noise,
}

fn default_cache_limit() -> u64 {
    DEFAULT_CACHE_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r##"
obfuscation:
  enabled: true
  site: aggregator
  low_cell_masking: { enabled: true, threshold: 10 }
  noise: { enabled: true, lower_bound: -5, upper_bound: 5 }
cache_limit: 1000
responders:
  - { id: 1, name: "Home", primary_colour: "#417505", total_patients: 1200000 }
  - { id: 2, name: "Partner", enabled: false, primary_colour: "#D0021B", latitude: 47.6, longitude: -122.3 }
"##;

    #[test]
    fn parses_sample_configuration() {
        let cfg = CoreConfig::from_yaml_str(SAMPLE).expect("valid config");
        assert!(cfg.policy().enabled());
        assert_eq!(cfg.policy().low_cell_masking().threshold, 10);
        assert_eq!(cfg.policy().noise().plus_minus(), 5);
        assert_eq!(cfg.obfuscation_site(), ObfuscationSite::Aggregator);
        assert_eq!(cfg.cache_limit(), 1000);
        assert_eq!(cfg.low_cell_masking_threshold(), 10);
        assert_eq!(cfg.responders().len(), 2);
        assert!(!cfg.responders()[1].enabled);
        assert_eq!(cfg.responders()[1].primary_colour.as_str(), "#d0021b");
    }

    #[test]
    fn defaults_cache_limit_and_threshold() {
        let text = r##"
obfuscation: { enabled: false }
responders:
  - { id: 1, name: "Home", primary_colour: "#417505" }
"##;
        let cfg = CoreConfig::from_yaml_str(text).expect("valid config");
        assert_eq!(cfg.cache_limit(), DEFAULT_CACHE_LIMIT);
        assert_eq!(cfg.low_cell_masking_threshold(), 0);
        assert!(!cfg.policy().enabled());
    }

    #[test]
    fn explicit_threshold_overrides_policy() {
        let text = SAMPLE.replace("cache_limit: 1000", "cache_limit: 1000\nlow_cell_masking_threshold: 25");
        let cfg = CoreConfig::from_yaml_str(&text).expect("valid config");
        assert_eq!(cfg.low_cell_masking_threshold(), 25);
    }

    #[test]
    fn rejects_zero_only_noise_range() {
        for (lower, upper) in [(0, 0), (0, 1), (3, -3)] {
            let noise = Noise {
                enabled: true,
                lower_bound: lower,
                upper_bound: upper,
            };
            let err = ObfuscationPolicy::new(true, LowCellMasking::default(), noise)
                .expect_err("range should be rejected");
            assert!(matches!(err, CohortError::InvalidConfig(_)));
        }
    }

    #[test]
    fn accepts_zero_range_when_noise_disabled() {
        let noise = Noise {
            enabled: false,
            lower_bound: 0,
            upper_bound: 0,
        };
        assert!(ObfuscationPolicy::new(true, LowCellMasking::default(), noise).is_ok());
    }

    #[test]
    fn rejects_negative_threshold() {
        let masking = LowCellMasking {
            enabled: true,
            threshold: -1,
        };
        let err = ObfuscationPolicy::new(true, masking, Noise::default())
            .expect_err("negative threshold");
        assert!(matches!(err, CohortError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unknown_keys_with_path() {
        let text = SAMPLE.replace("threshold: 10", "threshold: 10, extra: 1");
        let err = CoreConfig::from_yaml_str(&text).expect_err("unknown key");
        match err {
            CohortError::ConfigParse { path, message } => {
                assert!(path.contains("low_cell_masking"), "path was {path}");
                assert!(message.contains("extra"));
            }
            other => panic!("expected ConfigParse, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_responders() {
        let text = SAMPLE.replace("id: 2", "id: 1");
        let err = CoreConfig::from_yaml_str(&text).expect_err("duplicate ids");
        assert!(matches!(err, CohortError::DuplicateResponder(_)));
    }

    #[test]
    fn rejects_configuration_without_enabled_responder() {
        let text = r##"
obfuscation: { enabled: false }
responders:
  - { id: 1, name: "Home", enabled: false, primary_colour: "#417505" }
"##;
        let err = CoreConfig::from_yaml_str(text).expect_err("no enabled responder");
        assert!(matches!(err, CohortError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        let text = SAMPLE.replace("latitude: 47.6", "latitude: 147.6");
        let err = CoreConfig::from_yaml_str(&text).expect_err("bad latitude");
        assert!(matches!(err, CohortError::InvalidConfig(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write config");

        let cfg = CoreConfig::load(file.path()).expect("load config");
        assert_eq!(cfg.responders()[0].name.as_str(), "Home");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let err = CoreConfig::load(&dir.path().join("absent.yaml")).expect_err("missing file");
        assert!(matches!(err, CohortError::ConfigRead(_)));
    }

    #[test]
    fn config_path_requires_a_value() {
        assert!(config_path_from_env_value(None).is_err());
        assert!(config_path_from_env_value(Some("  ".into())).is_err());
        assert_eq!(
            config_path_from_env_value(Some(" leaf.yaml ".into())).unwrap(),
            PathBuf::from("leaf.yaml")
        );
    }
}
