//! Monotonic time sources.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic source of microsecond timestamps.
///
/// Timestamps are only meaningful relative to each other; the origin is
/// implementation-defined.
pub trait Clock: Send + Sync {
    /// Current time in microseconds. Never goes backwards.
    fn now_micros(&self) -> i64;
}

/// Real clock backed by [`Instant`], counting from its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_micros()).unwrap_or(i64::MAX)
    }
}

/// Hand-driven clock for tests and simulations.
///
/// Time only moves when told to, so refill behaviour can be checked without
/// sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    /// Create a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock starting at `micros`.
    pub fn starting_at(micros: i64) -> Self {
        Self {
            micros: AtomicI64::new(micros),
        }
    }

    /// Move time forward by `micros`. Negative values are ignored.
    pub fn advance(&self, micros: i64) {
        if micros > 0 {
            self.micros.fetch_add(micros, Ordering::SeqCst);
        }
    }

    /// Move time forward by a [`Duration`].
    pub fn advance_by(&self, duration: Duration) {
        self.advance(i64::try_from(duration.as_micros()).unwrap_or(i64::MAX));
    }

    /// Jump to `micros` if it is later than the current time.
    pub fn set(&self, micros: i64) {
        self.micros.fetch_max(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_never_regresses() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_micros();
        for _ in 0..1000 {
            let now = clock.now_micros();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_micros(), 0);

        clock.advance(1_500);
        assert_eq!(clock.now_micros(), 1_500);

        clock.advance_by(Duration::from_secs(2));
        assert_eq!(clock.now_micros(), 2_001_500);
    }

    #[test]
    fn test_manual_clock_ignores_backwards_moves() {
        let clock = ManualClock::starting_at(10_000);

        clock.advance(-5_000);
        assert_eq!(clock.now_micros(), 10_000);

        clock.set(2_000);
        assert_eq!(clock.now_micros(), 10_000);

        clock.set(20_000);
        assert_eq!(clock.now_micros(), 20_000);
    }
}
