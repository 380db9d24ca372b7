//! Read-only cache statistics.

use std::fmt;

use crate::entry::Tier;

/// Occupancy and hit count of one tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Resident entries.
    pub len: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Lookups served from this tier.
    pub hits: u64,
}

/// A point-in-time copy of a cache's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Per-tier figures, indexed by [`Tier::index`].
    pub tiers: [TierStats; 3],
    /// Lookups that found nothing (including expired entries).
    pub misses: u64,
    /// One-tier moves upward after a hit.
    pub promotions: u64,
    /// One-tier moves downward after eviction from a full tier.
    pub demotions: u64,
    /// Entries dropped because no lower tier could take them.
    pub evictions: u64,
    /// Entries removed for exceeding their tier's TTL.
    pub expirations: u64,
    /// Entries removed by explicit invalidation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Figures for `tier`.
    pub fn tier(&self, tier: Tier) -> &TierStats {
        &self.tiers[tier.index()]
    }

    /// Total resident entries.
    pub fn len(&self) -> usize {
        self.tiers.iter().map(|t| t.len).sum()
    }

    /// Whether nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total hits across tiers.
    pub fn hits(&self) -> u64 {
        self.tiers.iter().map(|t| t.hits).sum()
    }

    /// Hit rate as a percentage in `[0, 100]`; zero with no lookups.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 * 100.0 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [h, w, c] = &self.tiers;
        write!(
            f,
            "Cache[Hot={}/{},Warm={}/{},Cold={}/{}] Hits[H={},W={},C={}] Miss={} Rate={:.1}% P={} D={} Ev={} Exp={} Inv={}",
            h.len,
            h.capacity,
            w.len,
            w.capacity,
            c.len,
            c.capacity,
            h.hits,
            w.hits,
            c.hits,
            self.misses,
            self.hit_rate(),
            self.promotions,
            self.demotions,
            self.evictions,
            self.expirations,
            self.invalidations,
        )
    }
}
