//! Named tier policies.
//!
//! A policy bundles the tiers an admission layer applies to one kind of
//! request (for example "login" or "password-reset") so callers can refer to
//! them by name instead of repeating rate/capacity pairs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::profile::RateProfile;
use crate::error::{BurstgateError, Result};

/// One tier of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    /// Refill rate
    pub permits_per_second: f64,
    /// Burst storage in seconds of refill
    pub capacity_secs: f64,
}

impl TierRule {
    /// Validate this rule and turn it into a cache profile.
    pub fn to_profile(&self) -> Result<RateProfile> {
        RateProfile::new(self.permits_per_second, self.capacity_secs)
    }
}

/// A named, ordered list of tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Name used to look the policy up
    pub name: String,
    /// Warm-up permits for new buckets, in seconds; falls back to the limiter default
    #[serde(default)]
    pub precharge_secs: Option<f64>,
    /// Tiers, evaluated in order
    #[serde(default)]
    pub tiers: Vec<TierRule>,
}

impl TierPolicy {
    /// Profiles for every tier, in evaluation order.
    pub fn profiles(&self) -> Result<Vec<RateProfile>> {
        self.tiers.iter().map(TierRule::to_profile).collect()
    }

    /// Precharge to use, given the limiter's default.
    pub fn precharge_or(&self, default_secs: f64) -> f64 {
        self.precharge_secs.unwrap_or(default_secs)
    }

    /// Check every tier and that the precharge fits each of them.
    pub fn validate(&self, default_precharge_secs: f64) -> Result<()> {
        if self.name.is_empty() {
            return Err(BurstgateError::Config("policy name must not be empty".to_string()));
        }
        let precharge = self.precharge_or(default_precharge_secs);
        for profile in self.profiles().map_err(|e| self.config_error(e))? {
            profile
                .check_precharge(precharge)
                .map_err(|e| self.config_error(e))?;
        }
        Ok(())
    }

    fn config_error(&self, err: BurstgateError) -> BurstgateError {
        BurstgateError::Config(format!("policy '{}': {}", self.name, err))
    }
}

/// Policies indexed by name.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: HashMap<String, TierPolicy>,
}

impl PolicySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate names.
    pub fn from_policies(policies: impl IntoIterator<Item = TierPolicy>) -> Result<Self> {
        let mut set = Self::new();
        for policy in policies {
            set.insert(policy)?;
        }
        Ok(set)
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tier policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    ///
    /// Accepts either a single policy document or a list of policies.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(policy) = serde_yaml::from_str::<TierPolicy>(yaml) {
            return Self::from_policies([policy]);
        }

        let policies: Vec<TierPolicy> = serde_yaml::from_str(yaml)
            .map_err(|e| BurstgateError::Config(format!("Failed to parse tier policies: {}", e)))?;
        Self::from_policies(policies)
    }

    /// Add a policy. Fails if the name is already taken.
    pub fn insert(&mut self, policy: TierPolicy) -> Result<()> {
        if self.policies.contains_key(&policy.name) {
            return Err(BurstgateError::Config(format!(
                "duplicate policy name '{}'",
                policy.name
            )));
        }
        self.policies.insert(policy.name.clone(), policy);
        Ok(())
    }

    /// Look a policy up by name.
    pub fn find(&self, name: &str) -> Option<&TierPolicy> {
        self.policies.get(name)
    }

    /// Look a policy up by name, failing if it is unknown.
    pub fn get(&self, name: &str) -> Result<&TierPolicy> {
        self.find(name)
            .ok_or_else(|| BurstgateError::Config(format!("unknown policy '{}'", name)))
    }

    /// Policy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validate every policy.
    pub fn validate(&self, default_precharge_secs: f64) -> Result<()> {
        self.policies
            .values()
            .try_for_each(|policy| policy.validate(default_precharge_secs))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
