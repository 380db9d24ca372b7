//! Asynchronous compute-and-reconcile engine.
//!
//! Expensive per-tick computations are split into three phases:
//! a snapshot captured on the thread that owns the state, a pure
//! computation on a bounded worker pool, and a staleness-checked apply
//! back on the owning thread. [`AsyncPipeline`](pipeline::AsyncPipeline)
//! orchestrates the phases, memoizes results in a
//! [`TieredCache`](recon_cache::TieredCache), deduplicates in-flight
//! work, and falls back to synchronous computation on timeout, failure
//! or overload.
//!
//! Load shedding is driven by [`AdmissionController`](admission::AdmissionController),
//! fed from tick durations, and background work can be spread across
//! ticks by [`TaskSmoothingScheduler`](scheduler::TaskSmoothingScheduler).
//! [`OwnerThread`](owner::OwnerThread) and
//! [`PartitionedExecutor`](owner::PartitionedExecutor) provide the
//! owning threads themselves.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod admission;
pub mod config;
pub mod metrics;
pub mod owner;
pub mod pending;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod throttle;

pub use admission::{AdmissionController, AdmissionStats, LoadLevel};
pub use config::{
    AdmissionConfig, ConfigError, OwnerConfig, PipelineConfig, PoolConfig, SchedulerConfig,
};
pub use metrics::TickRateTracker;
pub use owner::{OwnerThread, PartitionedExecutor, TickHook, TickInfo};
pub use pending::Handle;
pub use pipeline::{
    AsyncPipeline, DrainReport, OverloadPolicy, PipelineStats, Request, Strategies,
};
pub use pool::{PoolShutdownReport, PoolStats, ThreadPool};
pub use registry::PartitionRegistry;
pub use scheduler::{CategoryStats, SchedulerStats, TaskSmoothingScheduler};
pub use throttle::ThrottledLog;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
///
/// Every value guarded in this crate stays structurally valid across a
/// panic (jobs run under `catch_unwind` outside the locks).
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
