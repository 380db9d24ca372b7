//! Tiers and resident entries.

use std::fmt;
use std::time::{Duration, Instant};

/// Cache rank. Hot is smallest and shortest-lived, cold largest and
/// longest-lived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Most recently used.
    Hot,
    /// Demoted from hot or promoted from cold.
    Warm,
    /// Long-term residence.
    Cold,
}

impl Tier {
    /// All tiers, hot first.
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    /// Position in [`Tier::ALL`].
    pub fn index(self) -> usize {
        match self {
            Self::Hot => 0,
            Self::Warm => 1,
            Self::Cold => 2,
        }
    }

    /// The tier an evicted entry moves into, if any.
    pub fn below(self) -> Option<Tier> {
        match self {
            Self::Hot => Some(Self::Warm),
            Self::Warm => Some(Self::Cold),
            Self::Cold => None,
        }
    }

    /// The tier a hit promotes into, if any.
    pub fn above(self) -> Option<Tier> {
        match self {
            Self::Hot => None,
            Self::Warm => Some(Self::Hot),
            Self::Cold => Some(Self::Warm),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        };
        f.write_str(s)
    }
}

/// A resident cache entry.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    /// When the value was stored. Ages and TTLs are measured from here.
    pub created_at: Instant,
    /// Last time the entry was returned by a lookup (or stored).
    pub last_access_at: Instant,
    /// Number of lookups that returned this entry.
    pub hit_count: u32,
    /// Tier the entry currently lives in.
    pub tier: Tier,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: V, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            last_access_at: now,
            hit_count: 0,
            tier: Tier::Hot,
        }
    }

    /// Age at `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Whether the entry is older than `ttl` at `now`.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.age(now) > ttl
    }

    pub(crate) fn record_hit(&mut self, now: Instant) {
        self.last_access_at = now;
        self.hit_count = self.hit_count.saturating_add(1);
    }
}
