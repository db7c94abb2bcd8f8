//! Token bucket with continuous refill and deferred debt.
//!
//! A bucket stores fractional permits up to `max_permits` and refills them at
//! one permit per `stable_interval_micros`. A request that is only partly
//! covered by stored permits is accepted immediately; the uncovered part is
//! charged as debt by pushing `next_free_ticket_micros` into the future, and the
//! bucket denies everything until that moment has passed. Callers are never
//! made to wait: every decision is an immediate accept or reject.

use parking_lot::{Mutex, MutexGuard};

use super::profile::RateProfile;
use crate::error::{BurstgateError, Result};

/// Mutable part of a bucket, guarded by the bucket's mutex.
#[derive(Debug, Clone, Copy)]
struct BucketState {
    stored_permits: f64,
    next_free_ticket_micros: i64,
    /// Set by the first accepted request
    drawn: bool,
}

/// A single (profile, target) token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    max_permits: f64,
    stable_interval_micros: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket for `profile`, precharged with `precharge_secs` worth of
    /// permits, whose clock starts at `now_micros`.
    pub fn new(profile: &RateProfile, precharge_secs: f64, now_micros: i64) -> Result<Self> {
        profile.check_precharge(precharge_secs)?;

        let max_permits = profile.max_permits();
        let stable_interval_micros = 1_000_000.0 / profile.permits_per_second();
        if !max_permits.is_finite() {
            return Err(BurstgateError::Construction(format!(
                "max permits for {} is not representable",
                profile
            )));
        }
        if !stable_interval_micros.is_finite() || stable_interval_micros <= 0.0 {
            return Err(BurstgateError::Construction(format!(
                "refill interval for {} is not representable",
                profile
            )));
        }

        let stored_permits = (profile.capacity_secs().min(precharge_secs)
            * profile.permits_per_second())
        .min(max_permits);

        Ok(Self {
            max_permits,
            stable_interval_micros,
            state: Mutex::new(BucketState {
                stored_permits,
                next_free_ticket_micros: now_micros,
                drawn: false,
            }),
        })
    }

    /// Try to take `permits` at `now_micros`.
    ///
    /// Returns `true` if the request was accepted. A denied request leaves the
    /// bucket exactly as it was.
    pub fn try_acquire(&self, now_micros: i64, permits: u32) -> bool {
        self.lock().acquire(now_micros, permits)
    }

    /// Lock the bucket for a multi-step decision.
    pub fn lock(&self) -> BucketGuard<'_> {
        BucketGuard {
            bucket: self,
            state: self.state.lock(),
        }
    }

    /// Permits that would be stored at `now_micros`, refill included.
    pub fn stored_permits(&self, now_micros: i64) -> f64 {
        let mut state = *self.state.lock();
        self.resync(&mut state, now_micros);
        state.stored_permits
    }

    /// Upper bound on stored permits.
    pub fn max_permits(&self) -> f64 {
        self.max_permits
    }

    /// Microseconds needed to refill one permit.
    pub fn stable_interval_micros(&self) -> f64 {
        self.stable_interval_micros
    }

    /// Timestamp before which the bucket denies every request.
    pub fn next_free_ticket_micros(&self) -> i64 {
        self.state.lock().next_free_ticket_micros
    }

    fn resync(&self, state: &mut BucketState, now_micros: i64) {
        if now_micros > state.next_free_ticket_micros {
            let elapsed = (now_micros - state.next_free_ticket_micros) as f64;
            let refilled = state.stored_permits + elapsed / self.stable_interval_micros;
            state.stored_permits = refilled.min(self.max_permits);
            state.next_free_ticket_micros = now_micros;
        }
    }

    fn admits(&self, state: &BucketState, now_micros: i64) -> bool {
        if state.next_free_ticket_micros > now_micros {
            return false;
        }
        // Once drawn, debt may only top up a request the store partly covers.
        // A fresh bucket and a bucket without storage pace purely on debt.
        state.stored_permits > 0.0 || !state.drawn || self.max_permits == 0.0
    }
}

/// Exclusive access to one bucket.
///
/// Holding several guards lets a caller check every tier before charging any
/// of them.
pub struct BucketGuard<'a> {
    bucket: &'a TokenBucket,
    state: MutexGuard<'a, BucketState>,
}

impl BucketGuard<'_> {
    /// Whether `permits` would be accepted at `now_micros`.
    pub fn can_acquire(&mut self, now_micros: i64) -> bool {
        self.bucket.resync(&mut self.state, now_micros);
        self.bucket.admits(&self.state, now_micros)
    }

    /// Take `permits` if the bucket admits a request at `now_micros`.
    pub fn acquire(&mut self, now_micros: i64, permits: u32) -> bool {
        if !self.can_acquire(now_micros) {
            return false;
        }

        let requested = f64::from(permits);
        let spent = self.state.stored_permits.min(requested);
        let fresh = requested - spent;
        let wait_micros = (fresh * self.bucket.stable_interval_micros) as i64;

        self.state.stored_permits -= spent;
        self.state.next_free_ticket_micros = now_micros.saturating_add(wait_micros);
        self.state.drawn = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: i64 = 1_000_000;

    fn bucket(rate: f64, capacity: f64, precharge: f64) -> TokenBucket {
        let profile = RateProfile::new(rate, capacity).unwrap();
        TokenBucket::new(&profile, precharge, 0).unwrap()
    }

    #[test]
    fn test_initial_precharge() {
        let bucket = bucket(5.0, 2.0, 1.5);
        assert_eq!(bucket.stored_permits(0), 7.5);
        assert_eq!(bucket.max_permits(), 10.0);
        assert_eq!(bucket.stable_interval_micros(), 200_000.0);
        assert_eq!(bucket.next_free_ticket_micros(), 0);
    }

    #[test]
    fn test_precharge_above_capacity_rejected() {
        let profile = RateProfile::new(5.0, 1.0).unwrap();
        let err = TokenBucket::new(&profile, 2.0, 0).unwrap_err();
        assert!(matches!(err, BurstgateError::InvalidArgument(_)));
    }

    #[test]
    fn test_unrepresentable_capacity_fails_construction() {
        let profile = RateProfile::new(1e300, 1e300).unwrap();
        let err = TokenBucket::new(&profile, 0.0, 0).unwrap_err();
        assert!(matches!(err, BurstgateError::Construction(_)));
    }

    #[test]
    fn test_burst_then_refill() {
        let bucket = bucket(5.0, 2.0, 2.0);

        for i in 0..10 {
            assert!(bucket.try_acquire(0, 1), "request {} should pass", i);
        }
        assert!(!bucket.try_acquire(0, 1));

        let now = SECOND;
        for i in 0..5 {
            assert!(bucket.try_acquire(now, 1), "refilled request {} should pass", i);
        }
        assert!(!bucket.try_acquire(now, 1));
    }

    #[test]
    fn test_refill_is_linear_and_capped() {
        let bucket = bucket(4.0, 3.0, 0.0);
        assert_eq!(bucket.stored_permits(0), 0.0);
        assert_eq!(bucket.stored_permits(SECOND / 2), 2.0);
        assert_eq!(bucket.stored_permits(2 * SECOND), 8.0);
        assert_eq!(bucket.stored_permits(10 * SECOND), 12.0);
    }

    #[test]
    fn test_partial_cover_creates_debt() {
        let bucket = bucket(10.0, 1.0, 0.5);

        // 5 stored, 3 borrowed at 100ms each
        assert!(bucket.try_acquire(0, 8));
        assert_eq!(bucket.stored_permits(0), 0.0);
        assert_eq!(bucket.next_free_ticket_micros(), 300_000);

        assert!(!bucket.try_acquire(299_999, 1));
        assert_eq!(bucket.next_free_ticket_micros(), 300_000);

        // Debt repaid, one permit earned since
        assert!(bucket.try_acquire(400_000, 1));
    }

    #[test]
    fn test_denial_leaves_state_untouched() {
        let bucket = bucket(1.0, 10.0, 0.5);
        assert!(bucket.try_acquire(0, 2));
        let next_free = bucket.next_free_ticket_micros();
        let stored = bucket.stored_permits(0);

        assert!(!bucket.try_acquire(100, 1));
        assert_eq!(bucket.next_free_ticket_micros(), next_free);
        assert_eq!(bucket.stored_permits(0), stored);
    }

    #[test]
    fn test_zero_capacity_paces_on_debt() {
        let bucket = bucket(2.0, 0.0, 0.0);

        assert!(bucket.try_acquire(0, 1));
        assert!(!bucket.try_acquire(499_999, 1));
        assert!(bucket.try_acquire(500_000, 1));
        assert!(!bucket.try_acquire(500_000, 1));
        assert_eq!(bucket.stored_permits(5 * SECOND), 0.0);
    }

    #[test]
    fn test_stored_permits_stay_in_bounds() {
        let bucket = bucket(3.0, 2.0, 1.0);
        let mut now = 0;

        for step in 0..500u32 {
            now += i64::from(step % 7) * 37_000;
            bucket.try_acquire(now, step % 4 + 1);
            let stored = bucket.stored_permits(now);
            assert!(stored >= 0.0, "stored went negative at step {}", step);
            assert!(stored <= bucket.max_permits(), "stored overflowed at step {}", step);
        }
    }

    #[test]
    fn test_next_free_ticket_never_decreases() {
        let bucket = bucket(7.0, 1.0, 1.0);
        let mut last = bucket.next_free_ticket_micros();
        let mut now = 0;

        for step in 0..200u32 {
            now += i64::from(step % 5) * 50_000;
            bucket.try_acquire(now, step % 3 + 1);
            let next_free = bucket.next_free_ticket_micros();
            assert!(next_free >= last);
            last = next_free;
        }
    }

    #[test]
    fn test_fresh_empty_bucket_borrows_first_request() {
        let bucket = bucket(10.0, 60.0, 0.0);

        assert!(bucket.try_acquire(0, 1));
        assert_eq!(bucket.next_free_ticket_micros(), 100_000);

        // In debt, then drawn and empty: no further borrowing
        assert!(!bucket.try_acquire(1, 1));
        assert!(!bucket.try_acquire(100_000, 1));
        assert!(bucket.try_acquire(100_001, 1));
    }

    #[test]
    fn test_drained_bucket_denies_when_empty() {
        let bucket = bucket(10.0, 60.0, 0.1);

        assert!(bucket.try_acquire(0, 1));
        assert_eq!(bucket.next_free_ticket_micros(), 0);
        assert!(!bucket.try_acquire(0, 1));
    }

    #[test]
    fn test_guard_check_without_charging() {
        let bucket = bucket(1.0, 5.0, 1.0);
        {
            let mut guard = bucket.lock();
            assert!(guard.can_acquire(0));
        }
        assert_eq!(bucket.stored_permits(0), 1.0);
    }
}
