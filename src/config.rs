//! Configuration management for Burstgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{BurstgateError, Result};
use crate::ratelimit::cache::DEFAULT_MAX_TARGETS;
use crate::ratelimit::rules::{PolicySet, TierPolicy};

/// Prefix for environment overrides, e.g. `BURSTGATE__LIMITER__ENABLED=false`.
const ENV_PREFIX: &str = "BURSTGATE";

/// Main configuration for Burstgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BurstgateConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Tier policies defined inline
    #[serde(default)]
    pub policies: Vec<TierPolicy>,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Global switch; when off every request is admitted
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Cap on cached buckets per rate profile
    #[serde(default = "default_max_targets")]
    pub max_targets_per_profile: u64,

    /// Precharge for policies that do not set their own
    #[serde(default)]
    pub default_precharge_secs: f64,

    /// Path to an additional tier policy file
    #[serde(default)]
    pub policies_path: Option<String>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_targets_per_profile: default_max_targets(),
            default_precharge_secs: 0.0,
            policies_path: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_targets() -> u64 {
    DEFAULT_MAX_TARGETS
}

impl BurstgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BurstgateError::Config(e.to_string()))
    }

    /// Load configuration from an optional file layered with `BURSTGATE__*`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: BurstgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BurstgateError::Config(e.to_string()))?;

        info!(
            path = path.unwrap_or("<none>"),
            enabled = config.limiter.enabled,
            policies = config.policies.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Check limiter settings and every policy.
    pub fn validate(&self) -> Result<()> {
        let precharge = self.limiter.default_precharge_secs;
        if !precharge.is_finite() || precharge < 0.0 {
            return Err(BurstgateError::Config(format!(
                "default_precharge_secs must be non-negative, got {}",
                precharge
            )));
        }
        if self.limiter.max_targets_per_profile == 0 {
            return Err(BurstgateError::Config(
                "max_targets_per_profile must be at least 1".to_string(),
            ));
        }
        self.policy_set()?.validate(precharge)
    }

    /// Collect inline policies and those from `policies_path`.
    pub fn policy_set(&self) -> Result<PolicySet> {
        let mut set = PolicySet::from_policies(self.policies.iter().cloned())?;
        if let Some(path) = &self.limiter.policies_path {
            let file_policies = PolicySet::from_file(Path::new(path))?;
            for name in file_policies.names() {
                set.insert(file_policies.get(name)?.clone())?;
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BurstgateConfig::default();
        assert!(config.limiter.enabled);
        assert_eq!(config.limiter.max_targets_per_profile, 100_000);
        assert_eq!(config.limiter.default_precharge_secs, 0.0);
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = BurstgateConfig::from_yaml("{}").unwrap();
        assert!(config.limiter.enabled);
        assert_eq!(config.limiter.max_targets_per_profile, 100_000);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
limiter:
  enabled: false
  max_targets_per_profile: 500
  default_precharge_secs: 1.5
policies:
  - name: login
    tiers:
      - permits_per_second: 10
        capacity_secs: 2
      - permits_per_second: 1
        capacity_secs: 60
"#;
        let config = BurstgateConfig::from_yaml(yaml).unwrap();
        assert!(!config.limiter.enabled);
        assert_eq!(config.limiter.max_targets_per_profile, 500);
        assert_eq!(config.limiter.default_precharge_secs, 1.5);

        config.validate().unwrap();
        let policies = config.policy_set().unwrap();
        assert_eq!(policies.get("login").unwrap().tiers.len(), 2);
    }

    #[test]
    fn test_validate_rejects_precharge_above_capacity() {
        let yaml = r#"
limiter:
  default_precharge_secs: 5
policies:
  - name: short
    tiers:
      - permits_per_second: 10
        capacity_secs: 1
"#;
        let config = BurstgateConfig::from_yaml(yaml).unwrap();
        assert!(matches!(config.validate(), Err(BurstgateError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let mut config = BurstgateConfig::default();
        config.limiter.max_targets_per_profile = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = BurstgateConfig::from_file("/nonexistent/burstgate.yaml").unwrap_err();
        assert!(matches!(err, BurstgateError::Io(_)));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = BurstgateConfig::load(None).unwrap();
        assert_eq!(config.limiter.max_targets_per_profile, 100_000);
    }

    #[test]
    fn test_load_layers_environment_over_file() {
        let path = std::env::temp_dir().join(format!(
            "burstgate-load-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"
limiter:
  enabled: false
  max_targets_per_profile: 500
  default_precharge_secs: 1.0
policies:
  - name: login
    tiers:
      - permits_per_second: 10
        capacity_secs: 5
"#,
        )
        .unwrap();

        std::env::set_var("BURSTGATE__LIMITER__DEFAULT_PRECHARGE_SECS", "2.5");
        let result = BurstgateConfig::load(path.to_str());
        std::env::remove_var("BURSTGATE__LIMITER__DEFAULT_PRECHARGE_SECS");
        std::fs::remove_file(&path).unwrap();

        let config = result.unwrap();
        assert!(!config.limiter.enabled);
        assert_eq!(config.limiter.max_targets_per_profile, 500);
        assert_eq!(config.limiter.default_precharge_secs, 2.5);
        assert_eq!(config.policies.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = BurstgateConfig::load(Some("/nonexistent/burstgate.yaml")).unwrap_err();
        assert!(matches!(err, BurstgateError::Config(_)));
    }
}
