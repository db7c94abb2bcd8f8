//! Rate limiting logic and state management.

pub mod cache;
pub mod clock;
mod bucket;
mod limiter;
mod profile;
pub mod rules;

pub use bucket::{BucketGuard, TokenBucket};
pub use cache::LimiterCache;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use limiter::RateLimiter;
pub use profile::RateProfile;
pub use rules::{PolicySet, TierPolicy, TierRule};
