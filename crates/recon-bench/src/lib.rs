//! Benchmark profiles and utilities for the recon engine.
//!
//! Provides pre-built configurations and workloads shared by the
//! benches and the example:
//!
//! - [`reference_pipeline`]: a grid-scan pipeline over a shared pool
//! - [`scan_positions`]: deterministic request positions via seed

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;
use std::time::Duration;

use recon_cache::{CacheConfig, TierConfig};
use recon_core::CellPos;
use recon_engine::{
    AdmissionConfig, AdmissionController, AsyncPipeline, ConfigError, PipelineConfig, PoolConfig,
    Strategies, ThreadPool,
};
use recon_test_utils::{GridApplier, GridSource, NetworkScan, SumComputation};

/// Cache sized for benchmark working sets: 1K hot, 4K warm, 16K cold.
pub fn reference_cache() -> CacheConfig {
    CacheConfig {
        hot: TierConfig {
            capacity: 1024,
            ttl: Duration::from_secs(10),
        },
        warm: TierConfig {
            capacity: 4096,
            ttl: Duration::from_secs(30),
        },
        cold: TierConfig {
            capacity: 16_384,
            ttl: Duration::from_secs(60),
        },
        sweep_interval: Duration::from_secs(5),
    }
}

/// Build a worker pool with `workers` threads.
pub fn reference_pool(workers: usize) -> Result<Arc<ThreadPool>, ConfigError> {
    ThreadPool::new(PoolConfig {
        worker_count: Some(workers),
        ..PoolConfig::default()
    })
    .map(Arc::new)
}

/// Build the reference grid-scan pipeline named `name` on `pool`.
pub fn reference_pipeline(
    name: &str,
    pool: Arc<ThreadPool>,
) -> Result<AsyncPipeline<NetworkScan>, ConfigError> {
    let admission = Arc::new(AdmissionController::new(AdmissionConfig::default())?);
    AsyncPipeline::new(
        PipelineConfig {
            cache: reference_cache(),
            ..PipelineConfig::named(name)
        },
        Strategies::new(GridSource::default(), SumComputation::default(), GridApplier),
        pool,
        admission,
    )
}

/// Generate `n` deterministic positions inside a cube of half-width `half`.
///
/// Uses an LCG over the seed, so identical seeds give identical streams.
pub fn scan_positions(n: usize, half: i32, seed: u64) -> Vec<CellPos> {
    let span = (2 * half + 1) as u64;
    let mut h = seed;
    (0..n)
        .map(|_| {
            h = h
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let axis = |shift: u32| ((h >> shift) % span) as i32 - half;
            CellPos::new(axis(11), axis(27), axis(43))
        })
        .collect()
}
