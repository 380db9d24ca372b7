//! Cache sizing and expiry configuration.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::entry::Tier;

/// Capacity and time-to-live of one tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierConfig {
    /// Maximum resident entries. A capacity of zero disables the tier;
    /// entries demoted into it are dropped.
    pub capacity: usize,
    /// Maximum age (measured from creation) an entry may have while
    /// resident in the tier.
    pub ttl: Duration,
}

/// Configuration for a [`TieredCache`](crate::TieredCache).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Hot tier. Default: 200 entries, 10 s.
    pub hot: TierConfig,
    /// Warm tier. Default: 500 entries, 30 s.
    pub warm: TierConfig,
    /// Cold tier. Default: 1000 entries, 60 s.
    pub cold: TierConfig,
    /// Minimum time between automatic expiry sweeps triggered by
    /// `put`. Default: 5 s.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot: TierConfig {
                capacity: 200,
                ttl: Duration::from_secs(10),
            },
            warm: TierConfig {
                capacity: 500,
                ttl: Duration::from_secs(30),
            },
            cold: TierConfig {
                capacity: 1000,
                ttl: Duration::from_secs(60),
            },
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    /// Settings for `tier`.
    pub fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    /// Sum of all tier capacities.
    pub fn total_capacity(&self) -> usize {
        self.hot.capacity + self.warm.capacity + self.cold.capacity
    }

    /// Check structural invariants.
    ///
    /// The hot tier must hold at least one entry, every TTL must be
    /// non-zero, TTLs must not decrease from hot to cold, and the sweep
    /// interval must be non-zero.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.hot.capacity == 0 {
            return Err(CacheConfigError::HotCapacityZero);
        }
        for tier in Tier::ALL {
            if self.tier(tier).ttl.is_zero() {
                return Err(CacheConfigError::ZeroTtl { tier });
            }
        }
        if self.hot.ttl > self.warm.ttl || self.warm.ttl > self.cold.ttl {
            return Err(CacheConfigError::TtlOrder {
                hot: self.hot.ttl,
                warm: self.warm.ttl,
                cold: self.cold.ttl,
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(CacheConfigError::ZeroSweepInterval);
        }
        Ok(())
    }
}

/// Errors detected by [`CacheConfig::validate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheConfigError {
    /// The hot tier has no room, so nothing could ever be stored.
    HotCapacityZero,
    /// A tier's TTL is zero.
    ZeroTtl {
        /// The offending tier.
        tier: Tier,
    },
    /// TTLs decrease somewhere between hot and cold.
    TtlOrder {
        /// Configured hot TTL.
        hot: Duration,
        /// Configured warm TTL.
        warm: Duration,
        /// Configured cold TTL.
        cold: Duration,
    },
    /// `sweep_interval` is zero.
    ZeroSweepInterval,
}

impl fmt::Display for CacheConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HotCapacityZero => write!(f, "hot tier capacity must be at least 1"),
            Self::ZeroTtl { tier } => write!(f, "{tier} tier ttl must be non-zero"),
            Self::TtlOrder { hot, warm, cold } => write!(
                f,
                "tier ttls must satisfy hot <= warm <= cold, got {hot:?} / {warm:?} / {cold:?}"
            ),
            Self::ZeroSweepInterval => write!(f, "sweep_interval must be non-zero"),
        }
    }
}

impl Error for CacheConfigError {}
