//! Rate profiles: the (rate, capacity) pair defining one tier.

use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::error::{BurstgateError, Result};

/// A rate limit tier: refill rate and burst capacity.
///
/// Profiles are compared and hashed on the bit patterns of their fields, so two
/// profiles built from the same numbers always select the same cache bucket.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateProfile {
    permits_per_second: f64,
    capacity_secs: f64,
}

impl RateProfile {
    /// Create a validated profile.
    ///
    /// `permits_per_second` must be finite and positive, `capacity_secs` finite
    /// and non-negative.
    pub fn new(permits_per_second: f64, capacity_secs: f64) -> Result<Self> {
        if !permits_per_second.is_finite() || permits_per_second <= 0.0 {
            return Err(BurstgateError::invalid(format!(
                "permits per second must be positive and finite, got {}",
                permits_per_second
            )));
        }
        if !capacity_secs.is_finite() || capacity_secs < 0.0 {
            return Err(BurstgateError::invalid(format!(
                "capacity seconds must be non-negative and finite, got {}",
                capacity_secs
            )));
        }

        Ok(Self {
            permits_per_second,
            // -0.0 and 0.0 must share a cache key
            capacity_secs: capacity_secs + 0.0,
        })
    }

    /// Parse a flat `(rate, capacity)` pair sequence.
    pub fn from_pairs(pairs: &[f64]) -> Result<Vec<Self>> {
        if pairs.len() % 2 != 0 {
            return Err(BurstgateError::invalid(format!(
                "tier pairs must have even length, got {}",
                pairs.len()
            )));
        }

        pairs
            .chunks_exact(2)
            .map(|pair| Self::new(pair[0], pair[1]))
            .collect()
    }

    /// Refill rate.
    pub fn permits_per_second(&self) -> f64 {
        self.permits_per_second
    }

    /// Burst storage expressed in seconds of refill.
    pub fn capacity_secs(&self) -> f64 {
        self.capacity_secs
    }

    /// Maximum number of permits a bucket for this profile may store.
    pub fn max_permits(&self) -> f64 {
        self.capacity_secs * self.permits_per_second
    }

    /// Idle time after which a cached bucket for this profile expires.
    pub fn idle_ttl_micros(&self) -> i64 {
        let micros = self.capacity_secs * 1_000_000.0;
        if micros >= i64::MAX as f64 {
            i64::MAX
        } else {
            micros as i64
        }
    }

    /// Check that a precharge fits this profile.
    pub fn check_precharge(&self, precharge_secs: f64) -> Result<()> {
        if !precharge_secs.is_finite() || precharge_secs < 0.0 {
            return Err(BurstgateError::invalid(format!(
                "precharge seconds must be non-negative and finite, got {}",
                precharge_secs
            )));
        }
        if self.capacity_secs < precharge_secs {
            return Err(BurstgateError::invalid(format!(
                "capacity seconds ({}) must not be less than precharge seconds ({})",
                self.capacity_secs, precharge_secs
            )));
        }
        Ok(())
    }

    fn key_bits(&self) -> (u64, u64) {
        (self.permits_per_second.to_bits(), self.capacity_secs.to_bits())
    }
}

impl PartialEq for RateProfile {
    fn eq(&self, other: &Self) -> bool {
        self.key_bits() == other.key_bits()
    }
}

impl Eq for RateProfile {}

impl Hash for RateProfile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_bits().hash(state);
    }
}

impl PartialOrd for RateProfile {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RateProfile {
    /// Canonical ordering used when several buckets must be locked together.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.permits_per_second
            .total_cmp(&other.permits_per_second)
            .then(self.capacity_secs.total_cmp(&other.capacity_secs))
    }
}

impl std::fmt::Display for RateProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/s:{}s", self.permits_per_second, self.capacity_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_profile_equality_and_hash() {
        let a = RateProfile::new(5.0, 2.0).unwrap();
        let b = RateProfile::new(5.0, 2.0).unwrap();
        let c = RateProfile::new(5.0, 3.0).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<RateProfile> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_negative_zero_capacity_is_zero() {
        let a = RateProfile::new(1.0, 0.0).unwrap();
        let b = RateProfile::new(1.0, -0.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_bad_rates() {
        assert!(RateProfile::new(0.0, 1.0).is_err());
        assert!(RateProfile::new(-1.0, 1.0).is_err());
        assert!(RateProfile::new(f64::NAN, 1.0).is_err());
        assert!(RateProfile::new(f64::INFINITY, 1.0).is_err());
    }

    #[test]
    fn test_rejects_bad_capacity() {
        assert!(RateProfile::new(1.0, -1.0).is_err());
        assert!(RateProfile::new(1.0, f64::NAN).is_err());
    }

    #[test]
    fn test_from_pairs() {
        let profiles = RateProfile::from_pairs(&[10.0, 1.0, 1.0, 10.0]).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].permits_per_second(), 10.0);
        assert_eq!(profiles[1].capacity_secs(), 10.0);

        assert!(RateProfile::from_pairs(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_from_pairs_odd_length() {
        let err = RateProfile::from_pairs(&[10.0, 1.0, 1.0]).unwrap_err();
        assert!(matches!(err, BurstgateError::InvalidArgument(_)));
    }

    #[test]
    fn test_check_precharge() {
        let profile = RateProfile::new(5.0, 2.0).unwrap();
        assert!(profile.check_precharge(0.0).is_ok());
        assert!(profile.check_precharge(2.0).is_ok());
        assert!(profile.check_precharge(2.5).is_err());
        assert!(profile.check_precharge(-0.5).is_err());
    }

    #[test]
    fn test_derived_values() {
        let profile = RateProfile::new(5.0, 2.0).unwrap();
        assert_eq!(profile.max_permits(), 10.0);
        assert_eq!(profile.idle_ttl_micros(), 2_000_000);
        assert_eq!(profile.to_string(), "5/s:2s");
    }
}
