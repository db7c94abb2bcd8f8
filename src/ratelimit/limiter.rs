//! Public rate limiting surface.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, trace};

use super::bucket::TokenBucket;
use super::cache::LimiterCache;
use super::clock::{Clock, MonotonicClock};
use super::profile::RateProfile;
use super::rules::TierPolicy;
use crate::config::LimiterSettings;
use crate::error::{BurstgateError, Result};

/// The rate limiter consulted by the admission layer.
///
/// Every call is an immediate decision: `Ok(true)` to admit, `Ok(false)` to
/// throttle. Buckets are created on first use and owned by the internal
/// cache, so the limiter can be shared freely across threads.
pub struct RateLimiter {
    cache: LimiterCache,
    clock: Arc<dyn Clock>,
    enabled: AtomicBool,
    default_precharge_secs: f64,
}

impl RateLimiter {
    /// Create an enabled limiter on the real clock with default settings.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Create an enabled limiter with default settings on `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::from_settings(&LimiterSettings::default(), clock)
    }

    /// Create a limiter from configuration.
    pub fn from_settings(settings: &LimiterSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: LimiterCache::with_max_targets(settings.max_targets_per_profile),
            clock,
            enabled: AtomicBool::new(settings.enabled),
            default_precharge_secs: settings.default_precharge_secs,
        }
    }

    /// Whether limits are currently enforced.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn enforcement on or off.
    ///
    /// While disabled no bucket is read or charged, so re-enabling resumes
    /// from the state buckets had before.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled = enabled, "Rate limiting toggled");
        }
    }

    /// Try to take `permits` for `target` from a single tier.
    pub fn try_acquire(
        &self,
        target: &str,
        permits: u32,
        precharge_secs: f64,
        permits_per_second: f64,
        capacity_secs: f64,
    ) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }
        check_permits(permits)?;

        let profile = RateProfile::new(permits_per_second, capacity_secs)?;
        self.acquire_tier(target, permits, precharge_secs, &profile)
    }

    /// Try to take `permits` for `target` from several tiers.
    ///
    /// `tier_pairs` is a flat list of `(permits_per_second, capacity_secs)`
    /// pairs. See [`RateLimiter::try_acquire_profiles`] for the semantics.
    pub fn try_acquire_tiers(
        &self,
        target: &str,
        permits: u32,
        precharge_secs: f64,
        tier_pairs: &[f64],
    ) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }

        let profiles = RateProfile::from_pairs(tier_pairs)?;
        self.try_acquire_profiles(target, permits, precharge_secs, &profiles)
    }

    /// Try to take `permits` for `target` from every tier in order.
    ///
    /// Evaluation stops at the first tier that denies. Tiers evaluated before
    /// it keep the permits they handed out even though the call returns
    /// `false`; use [`RateLimiter::try_acquire_all`] when that is unwanted.
    /// All arguments are validated before any bucket is touched.
    pub fn try_acquire_profiles(
        &self,
        target: &str,
        permits: u32,
        precharge_secs: f64,
        profiles: &[RateProfile],
    ) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }
        check_permits(permits)?;
        for profile in profiles {
            profile.check_precharge(precharge_secs)?;
        }

        for (tier, profile) in profiles.iter().enumerate() {
            if !self.acquire_tier(target, permits, precharge_secs, profile)? {
                trace!(
                    identity = %target,
                    tier = tier,
                    profile = %profile,
                    "Tier denied, skipping remaining tiers"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// All-or-nothing variant of [`RateLimiter::try_acquire_profiles`].
    ///
    /// Every tier bucket is locked, and permits are taken only if all of them
    /// admit the request; a denial charges no tier. A profile listed more than
    /// once is charged once per listing.
    pub fn try_acquire_all(
        &self,
        target: &str,
        permits: u32,
        precharge_secs: f64,
        profiles: &[RateProfile],
    ) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }
        check_permits(permits)?;
        for profile in profiles {
            profile.check_precharge(precharge_secs)?;
        }

        // Canonical order keeps concurrent callers from deadlocking.
        let mut charges: BTreeMap<RateProfile, u32> = BTreeMap::new();
        for profile in profiles {
            let charge = charges.entry(*profile).or_insert(0);
            *charge = charge.saturating_add(permits);
        }

        let now = self.clock.now_micros();
        let buckets: Vec<(Arc<TokenBucket>, u32)> = charges
            .iter()
            .map(|(profile, charge)| {
                self.cache
                    .get_or_create(profile, target, precharge_secs, now)
                    .map(|bucket| (bucket, *charge))
            })
            .collect::<Result<_>>()?;

        let mut guards: Vec<_> = buckets
            .iter()
            .map(|(bucket, charge)| (bucket.lock(), *charge))
            .collect();

        let now = self.clock.now_micros();
        if !guards.iter_mut().all(|(guard, _)| guard.can_acquire(now)) {
            trace!(identity = %target, permits = permits, "Denied by at least one tier");
            return Ok(false);
        }
        for (guard, charge) in guards.iter_mut() {
            guard.acquire(now, *charge);
        }

        trace!(identity = %target, permits = permits, tiers = profiles.len(), "Accepted");
        Ok(true)
    }

    /// Apply a named policy with short-circuit semantics.
    pub fn try_acquire_policy(
        &self,
        target: &str,
        permits: u32,
        policy: &TierPolicy,
    ) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }

        let profiles = policy.profiles()?;
        let precharge = policy.precharge_or(self.default_precharge_secs);
        self.try_acquire_profiles(target, permits, precharge, &profiles)
    }

    /// Forget every bucket; every target starts over from its precharge.
    pub fn clear_all(&self) {
        let dropped = self.cache.len();
        self.cache.clear_all();
        info!(dropped = dropped, "Cleared all rate limit buckets");
    }

    /// Remove idle buckets now instead of waiting for their next access.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired(self.clock.now_micros())
    }

    /// Number of cached buckets.
    pub fn cached_buckets(&self) -> usize {
        self.cache.len()
    }

    /// Permits currently stored for (`profile`, `target`), if a live bucket exists.
    pub fn stored_permits(&self, profile: &RateProfile, target: &str) -> Option<f64> {
        let now = self.clock.now_micros();
        self.cache
            .get(profile, target, now)
            .map(|bucket| bucket.stored_permits(now))
    }

    fn acquire_tier(
        &self,
        target: &str,
        permits: u32,
        precharge_secs: f64,
        profile: &RateProfile,
    ) -> Result<bool> {
        let now = self.clock.now_micros();
        let bucket = self
            .cache
            .get_or_create(profile, target, precharge_secs, now)?;
        let accepted = bucket.try_acquire(now, permits);

        trace!(
            identity = %target,
            profile = %profile,
            permits = permits,
            accepted = accepted,
            "Rate limit decision"
        );
        Ok(accepted)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn check_permits(permits: u32) -> Result<()> {
    if permits == 0 {
        return Err(BurstgateError::invalid("permits must be at least 1"));
    }
    Ok(())
}
