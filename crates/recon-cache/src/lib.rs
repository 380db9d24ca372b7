//! Hot/warm/cold tiered memoization cache for the recon engine.
//!
//! [`TieredCache`] stores computed results keyed by
//! [`Fingerprint`](recon_core::Fingerprint). Entries are born in the
//! hot tier and move down one tier when a full tier evicts them, but
//! only into a tier with room; otherwise they are dropped. They climb
//! back one tier per hit and expire once older than their tier's TTL.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
pub mod entry;
pub mod stats;
pub mod tiered;

pub use config::{CacheConfig, CacheConfigError, TierConfig};
pub use entry::{CacheEntry, Tier};
pub use stats::{CacheStats, TierStats};
pub use tiered::TieredCache;
