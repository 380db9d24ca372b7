//! The tiered cache itself.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use indexmap::IndexMap;
use recon_core::{CellPos, Clock, Fingerprint, MonotonicClock};

use crate::config::{CacheConfig, CacheConfigError};
use crate::entry::{CacheEntry, Tier};
use crate::stats::{CacheStats, TierStats};

/// Three-tier memoization store keyed by [`Fingerprint`].
///
/// Each tier is an insertion-ordered map whose front is the
/// least-recently-used entry. Every key lives in exactly one tier.
///
/// - `get` checks hot, warm, then cold. A hit in warm or cold promotes
///   the entry one tier up; a hit in hot refreshes its recency.
/// - `put` always lands in hot. A full tier evicts its LRU entry into
///   the tier below only if that tier has room; otherwise the entry is
///   dropped. Eviction never pushes a second entry further down.
/// - An entry older than its tier's TTL is a miss and is removed on
///   sight. `put` also sweeps all tiers once per sweep interval.
///
/// A promotion that would place an entry in a tier whose TTL it already
/// exceeds is skipped; the entry stays where it is. A promotion into a
/// full tier swaps: that tier's LRU entry takes the vacated slot below.
///
/// All operations take one internal lock and never fail; a full cache
/// degrades by evicting.
pub struct TieredCache<V> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<V>>,
}

#[derive(Default)]
struct Counters {
    hits: [u64; 3],
    misses: u64,
    promotions: u64,
    demotions: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
}

struct Inner<V> {
    tiers: [IndexMap<Fingerprint, CacheEntry<V>>; 3],
    counters: Counters,
    last_sweep: Instant,
}

impl<V> Inner<V> {
    fn find(&self, key: &Fingerprint) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|t| self.tiers[t.index()].contains_key(key))
    }

    fn remove(&mut self, key: &Fingerprint) -> Option<CacheEntry<V>> {
        let tier = self.find(key)?;
        self.tiers[tier.index()].shift_remove(key)
    }

    /// Place `entry` at the most-recent end of `tier`, making room first.
    fn insert(
        &mut self,
        cfg: &CacheConfig,
        tier: Tier,
        key: Fingerprint,
        mut entry: CacheEntry<V>,
        now: Instant,
    ) {
        let capacity = cfg.tier(tier).capacity;
        if capacity == 0 {
            self.counters.evictions += 1;
            return;
        }
        while self.tiers[tier.index()].len() >= capacity {
            match self.tiers[tier.index()].shift_remove_index(0) {
                Some((victim_key, victim)) => {
                    if !self.demote(cfg, tier, victim_key, victim, now) {
                        self.counters.evictions += 1;
                    }
                }
                None => break,
            }
        }
        entry.tier = tier;
        self.tiers[tier.index()].insert(key, entry);
    }

    /// Move `entry` into the tier below `from` if that tier has room and
    /// its TTL still covers the entry. Returns `false` if the entry was
    /// dropped.
    fn demote(
        &mut self,
        cfg: &CacheConfig,
        from: Tier,
        key: Fingerprint,
        mut entry: CacheEntry<V>,
        now: Instant,
    ) -> bool {
        let Some(next) = from.below() else {
            return false;
        };
        let limits = cfg.tier(next);
        let map = &mut self.tiers[next.index()];
        if map.len() >= limits.capacity || entry.is_expired(now, limits.ttl) {
            return false;
        }
        entry.tier = next;
        map.insert(key, entry);
        self.counters.demotions += 1;
        true
    }

    fn sweep(&mut self, cfg: &CacheConfig, now: Instant) -> usize {
        let mut removed = 0;
        for tier in Tier::ALL {
            let ttl = cfg.tier(tier).ttl;
            let map = &mut self.tiers[tier.index()];
            let before = map.len();
            map.retain(|_, e| !e.is_expired(now, ttl));
            removed += before - map.len();
        }
        self.counters.expirations += removed as u64;
        self.last_sweep = now;
        removed
    }
}

impl<V: Clone> TieredCache<V> {
    /// Create a cache on the monotonic wall clock.
    pub fn new(config: CacheConfig) -> Result<Self, CacheConfigError> {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    /// Create a cache reading time from `clock`.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, CacheConfigError> {
        config.validate()?;
        let now = clock.now();
        let inner = Inner {
            tiers: [
                IndexMap::with_capacity(config.hot.capacity),
                IndexMap::with_capacity(config.warm.capacity),
                IndexMap::with_capacity(config.cold.capacity),
            ],
            counters: Counters::default(),
            last_sweep: now,
        };
        Ok(Self {
            config,
            clock,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`, promoting it on a warm or cold hit.
    pub fn get(&self, key: &Fingerprint) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let Some(tier) = inner.find(key) else {
            inner.counters.misses += 1;
            return None;
        };
        let idx = tier.index();
        let mut entry = inner.tiers[idx].shift_remove(key)?;
        if entry.is_expired(now, self.config.tier(tier).ttl) {
            inner.counters.expirations += 1;
            inner.counters.misses += 1;
            return None;
        }

        inner.counters.hits[idx] += 1;
        entry.record_hit(now);
        let value = entry.value.clone();
        match tier.above() {
            Some(up) if !entry.is_expired(now, self.config.tier(up).ttl) => {
                inner.counters.promotions += 1;
                inner.insert(&self.config, up, *key, entry, now);
            }
            _ => {
                inner.tiers[idx].insert(*key, entry);
            }
        }
        Some(value)
    }

    /// Store `value` under `key` in the hot tier.
    ///
    /// Replaces any existing entry for `key`, wherever it lives.
    pub fn put(&self, key: Fingerprint, value: V) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.remove(&key);
        inner.insert(&self.config, Tier::Hot, key, CacheEntry::new(value, now), now);

        if now.saturating_duration_since(inner.last_sweep) >= self.config.sweep_interval {
            let removed = inner.sweep(&self.config, now);
            if removed > 0 {
                tracing::debug!(removed, "tiered cache sweep");
            }
        }
    }

    /// A copy of the resident entry for `key`, without touching recency,
    /// expiry, or statistics.
    pub fn peek(&self, key: &Fingerprint) -> Option<CacheEntry<V>> {
        let inner = self.lock();
        let tier = inner.find(key)?;
        inner.tiers[tier.index()].get(key).cloned()
    }

    /// Remove `key`. Returns whether it was resident.
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        let mut inner = self.lock();
        let removed = inner.remove(key).is_some();
        if removed {
            inner.counters.invalidations += 1;
        }
        removed
    }

    /// Remove every entry whose anchor lies within Manhattan distance
    /// `radius` of `center`. Keys without an anchor are untouched.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_region(&self, center: CellPos, radius: u64) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        for map in inner.tiers.iter_mut() {
            let before = map.len();
            map.retain(|k, _| match k.anchor() {
                Some(pos) => pos.manhattan(&center) > radius,
                None => true,
            });
            removed += before - map.len();
        }
        inner.counters.invalidations += removed as u64;
        removed
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        for map in inner.tiers.iter_mut() {
            map.clear();
        }
    }

    /// Remove every expired entry now. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let removed = inner.sweep(&self.config, now);
        tracing::debug!(removed, "tiered cache sweep");
        removed
    }

    /// Tier currently holding `key`, if resident.
    pub fn tier_of(&self, key: &Fingerprint) -> Option<Tier> {
        self.lock().find(key)
    }

    /// Whether `key` is resident and not expired.
    pub fn contains(&self, key: &Fingerprint) -> bool {
        let now = self.clock.now();
        let inner = self.lock();
        match inner.find(key) {
            Some(tier) => inner.tiers[tier.index()]
                .get(key)
                .is_some_and(|e| !e.is_expired(now, self.config.tier(tier).ttl)),
            None => false,
        }
    }

    /// Total resident entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().tiers.iter().map(IndexMap::len).sum()
    }

    /// Whether nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident entries in `tier`.
    pub fn tier_len(&self, tier: Tier) -> usize {
        self.lock().tiers[tier.index()].len()
    }

    /// Snapshot of sizes and counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let c = &inner.counters;
        let mut tiers = [TierStats::default(); 3];
        for tier in Tier::ALL {
            let i = tier.index();
            tiers[i] = TierStats {
                len: inner.tiers[i].len(),
                capacity: self.config.tier(tier).capacity,
                hits: c.hits[i],
            };
        }
        CacheStats {
            tiers,
            misses: c.misses,
            promotions: c.promotions,
            demotions: c.demotions,
            evictions: c.evictions,
            expirations: c.expirations,
            invalidations: c.invalidations,
        }
    }

    /// Zero every counter. Resident entries are kept.
    pub fn reset_stats(&self) {
        self.lock().counters = Counters::default();
    }
}

impl<V: Clone> fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

// Compile-time assertion: shareable between the owning thread and
// completion handlers.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<TieredCache<Vec<u8>>>();
};
