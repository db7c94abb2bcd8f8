//! Two-level bucket cache: profile, then target.
//!
//! The outer map holds one [`TargetCache`] per distinct [`RateProfile`] and
//! never expires. Each target cache maps a target identity to its bucket and
//! expires entries that have been idle for the profile's capacity. Both levels
//! are sharded [`DashMap`]s, so a lookup only takes a shared lock on one shard
//! and a miss takes the write lock of that shard alone.
//!
//! Expiration is lazy: an expired entry is replaced when it is next accessed,
//! or removed by [`LimiterCache::purge_expired`]. When a target cache grows past
//! its cap, expired entries are swept first and then the least recently used
//! ones are evicted. That eviction is approximate: concurrent access can change
//! which entries survive.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::bucket::TokenBucket;
use super::profile::RateProfile;
use crate::error::Result;

/// Default cap on live targets per profile.
pub const DEFAULT_MAX_TARGETS: u64 = 100_000;

/// A cached bucket and the last time it was handed out.
#[derive(Debug)]
struct Slot {
    bucket: Arc<TokenBucket>,
    last_access_micros: AtomicI64,
}

impl Slot {
    fn new(bucket: TokenBucket, now_micros: i64) -> Self {
        Self {
            bucket: Arc::new(bucket),
            last_access_micros: AtomicI64::new(now_micros),
        }
    }

    fn last_access(&self) -> i64 {
        self.last_access_micros.load(Ordering::Acquire)
    }

    fn touch(&self, now_micros: i64) {
        self.last_access_micros.fetch_max(now_micros, Ordering::AcqRel);
    }

    fn is_expired(&self, now_micros: i64, ttl_micros: i64) -> bool {
        now_micros.saturating_sub(self.last_access()) >= ttl_micros
    }
}

/// Buckets for every target under one profile.
#[derive(Debug)]
struct TargetCache {
    profile: RateProfile,
    ttl_micros: i64,
    max_targets: usize,
    slots: DashMap<String, Slot>,
}

impl TargetCache {
    fn new(profile: RateProfile, max_targets: usize) -> Self {
        Self {
            profile,
            ttl_micros: profile.idle_ttl_micros(),
            max_targets,
            slots: DashMap::new(),
        }
    }

    fn get_or_create(
        &self,
        target: &str,
        precharge_secs: f64,
        now_micros: i64,
    ) -> Result<Arc<TokenBucket>> {
        if let Some(slot) = self.slots.get(target) {
            if !slot.is_expired(now_micros, self.ttl_micros) {
                slot.touch(now_micros);
                return Ok(Arc::clone(&slot.bucket));
            }
        }

        let (bucket, inserted) = match self.slots.entry(target.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now_micros, self.ttl_micros) {
                    debug!(
                        profile = %self.profile,
                        identity = %target,
                        "Replacing expired bucket"
                    );
                    let slot = Slot::new(
                        TokenBucket::new(&self.profile, precharge_secs, now_micros)?,
                        now_micros,
                    );
                    let bucket = Arc::clone(&slot.bucket);
                    occupied.insert(slot);
                    (bucket, false)
                } else {
                    // Lost the race to another creator
                    occupied.get().touch(now_micros);
                    (Arc::clone(&occupied.get().bucket), false)
                }
            }
            Entry::Vacant(vacant) => {
                debug!(
                    profile = %self.profile,
                    identity = %target,
                    precharge_secs = precharge_secs,
                    "Creating new bucket"
                );
                let slot = Slot::new(
                    TokenBucket::new(&self.profile, precharge_secs, now_micros)?,
                    now_micros,
                );
                let bucket = Arc::clone(&slot.bucket);
                vacant.insert(slot);
                (bucket, true)
            }
        };

        if inserted && self.slots.len() > self.max_targets {
            self.evict_overflow(now_micros);
        }

        Ok(bucket)
    }

    fn purge_expired(&self, now_micros: i64) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.is_expired(now_micros, self.ttl_micros));
        before.saturating_sub(self.slots.len())
    }

    fn evict_overflow(&self, now_micros: i64) {
        let expired = self.purge_expired(now_micros);
        let len = self.slots.len();
        if len <= self.max_targets {
            debug!(profile = %self.profile, expired = expired, "Swept expired buckets");
            return;
        }

        // Evict a little extra so the next few inserts do not rescan.
        let slack = self.max_targets / 16;
        let excess = (len - self.max_targets + slack).min(len);

        let mut candidates: Vec<(i64, String)> = self
            .slots
            .iter()
            .map(|entry| (entry.value().last_access(), entry.key().clone()))
            .collect();
        if excess < candidates.len() {
            candidates.select_nth_unstable_by_key(excess, |(last_access, _)| *last_access);
            candidates.truncate(excess);
        }

        let mut evicted = 0;
        for (seen, target) in candidates {
            // Skip entries touched since the scan
            if self
                .slots
                .remove_if(&target, |_, slot| slot.last_access() == seen)
                .is_some()
            {
                evicted += 1;
            }
        }

        debug!(
            profile = %self.profile,
            expired = expired,
            evicted = evicted,
            remaining = self.slots.len(),
            "Evicted least recently used buckets"
        );
    }
}

/// Cache of token buckets keyed by profile and target.
#[derive(Debug)]
pub struct LimiterCache {
    profiles: DashMap<RateProfile, Arc<TargetCache>>,
    max_targets: usize,
}

impl LimiterCache {
    /// Create a cache with the default per-profile cap.
    pub fn new() -> Self {
        Self::with_max_targets(DEFAULT_MAX_TARGETS)
    }

    /// Create a cache holding at most `max_targets` buckets per profile.
    pub fn with_max_targets(max_targets: u64) -> Self {
        Self {
            profiles: DashMap::new(),
            max_targets: usize::try_from(max_targets.max(1)).unwrap_or(usize::MAX),
        }
    }

    /// Return the live bucket for (`profile`, `target`), creating it if needed.
    ///
    /// A new bucket starts with `min(capacity, precharge) * rate` permits.
    /// Concurrent callers racing on the same key all receive the same bucket.
    /// Arguments are validated before anything is inserted.
    pub fn get_or_create(
        &self,
        profile: &RateProfile,
        target: &str,
        precharge_secs: f64,
        now_micros: i64,
    ) -> Result<Arc<TokenBucket>> {
        profile.check_precharge(precharge_secs)?;
        self.target_cache(profile)
            .get_or_create(target, precharge_secs, now_micros)
    }

    /// Return the bucket for (`profile`, `target`) if one is cached and live.
    ///
    /// Peeking does not refresh the idle timer.
    pub fn get(
        &self,
        profile: &RateProfile,
        target: &str,
        now_micros: i64,
    ) -> Option<Arc<TokenBucket>> {
        let targets = self.profiles.get(profile)?;
        let slot = targets.slots.get(target)?;
        if slot.is_expired(now_micros, targets.ttl_micros) {
            return None;
        }
        let bucket = Arc::clone(&slot.bucket);
        Some(bucket)
    }

    /// Drop every cached bucket.
    pub fn clear_all(&self) {
        self.profiles.clear();
    }

    /// Remove expired buckets across all profiles. Returns how many were removed.
    pub fn purge_expired(&self, now_micros: i64) -> usize {
        let caches: Vec<Arc<TargetCache>> = self
            .profiles
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        caches
            .iter()
            .map(|targets| targets.purge_expired(now_micros))
            .sum()
    }

    /// Number of cached buckets, expired ones not yet purged included.
    pub fn len(&self) -> usize {
        self.profiles.iter().map(|entry| entry.value().slots.len()).sum()
    }

    /// Whether no bucket is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct profiles seen since the last clear.
    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    fn target_cache(&self, profile: &RateProfile) -> Arc<TargetCache> {
        if let Some(targets) = self.profiles.get(profile) {
            return Arc::clone(targets.value());
        }
        let targets = self
            .profiles
            .entry(*profile)
            .or_insert_with(|| Arc::new(TargetCache::new(*profile, self.max_targets)));
        let targets = Arc::clone(targets.value());
        targets
    }
}

impl Default for LimiterCache {
    fn default() -> Self {
        Self::new()
    }
}
