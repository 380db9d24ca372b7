//! Bounded worker pool for pure computations.
//!
//! Each worker receives [`Job`]s via a bounded crossbeam channel and
//! runs them under `catch_unwind`. Submission never blocks: a full
//! queue is reported as [`ComputeError::QueueSaturated`] so the caller
//! can fall back to synchronous work.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use recon_core::{ComputeError, Job, WorkerPool};

use crate::config::{ConfigError, PoolConfig};
use crate::lock;

#[derive(Debug, Default)]
struct PoolCounters {
    executed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
}

/// Report from [`ThreadPool::shutdown`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolShutdownReport {
    /// Worker threads joined cleanly.
    pub workers_joined: usize,
    /// Jobs run to completion over the pool's lifetime.
    pub jobs_executed: u64,
    /// Jobs that panicked over the pool's lifetime.
    pub jobs_panicked: u64,
    /// Time spent draining and joining.
    pub total_ms: u64,
}

/// Point-in-time pool statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolStats {
    /// Worker threads.
    pub workers: usize,
    /// Jobs waiting in the queue.
    pub queued: usize,
    /// Queue capacity.
    pub capacity: usize,
    /// Jobs run to completion.
    pub executed: u64,
    /// Jobs that panicked.
    pub panicked: u64,
    /// Submissions refused (queue full or shut down).
    pub rejected: u64,
    /// Whether the pool currently reports healthy.
    pub healthy: bool,
}

impl PoolStats {
    /// Queue occupancy in `[0, 1]`.
    pub fn occupancy(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.queued as f64 / self.capacity as f64
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool: Workers={} | Queue={}/{} | Executed={} | Panicked={} | Rejected={} | Healthy={}",
            self.workers,
            self.queued,
            self.capacity,
            self.executed,
            self.panicked,
            self.rejected,
            self.healthy,
        )
    }
}

/// Fixed-size pool of named worker threads (`recon-worker-{i}`).
pub struct ThreadPool {
    config: PoolConfig,
    capacity: usize,
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
}

impl ThreadPool {
    /// Validate `config` and spawn the workers.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let worker_count = config.resolved_worker_count();
        let capacity = config.queue_capacity();
        let (tx, rx) = crossbeam_channel::bounded::<Job>(capacity);
        let counters = Arc::new(PoolCounters::default());

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let rx = rx.clone();
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("recon-worker-{i}"))
                .spawn(move || worker_loop(rx, counters))
                .map_err(|e| ConfigError::ThreadSpawnFailed {
                    reason: format!("recon-worker-{i}: {e}"),
                })?;
            workers.push(handle);
        }

        Ok(Self {
            config,
            capacity,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Jobs currently queued (not yet picked up by a worker).
    pub fn queued(&self) -> usize {
        lock(&self.tx).as_ref().map_or(0, Sender::len)
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: lock(&self.workers).len(),
            queued: self.queued(),
            capacity: self.capacity,
            executed: self.counters.executed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
        }
    }

    /// Close the queue, let workers finish what is queued, and join them.
    ///
    /// Idempotent: later calls join nothing and report zero workers.
    pub fn shutdown(&self) -> PoolShutdownReport {
        let start = Instant::now();
        lock(&self.tx).take();

        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        let mut workers_joined = 0;
        for handle in handles {
            if handle.join().is_ok() {
                workers_joined += 1;
            }
        }
        PoolShutdownReport {
            workers_joined,
            jobs_executed: self.counters.executed.load(Ordering::Relaxed),
            jobs_panicked: self.counters.panicked.load(Ordering::Relaxed),
            total_ms: start.elapsed().as_millis() as u64,
        }
    }
}

impl WorkerPool for ThreadPool {
    fn try_submit(&self, job: Job) -> Result<(), ComputeError> {
        let guard = lock(&self.tx);
        let Some(tx) = guard.as_ref() else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ComputeError::PoolUnavailable);
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(ComputeError::QueueSaturated)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(ComputeError::PoolUnavailable)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        match lock(&self.tx).as_ref() {
            Some(tx) => (tx.len() as f64) <= self.config.unhealthy_occupancy * self.capacity as f64,
            None => false,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if lock(&self.tx).is_some() {
            self.shutdown();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Main loop for a worker thread.
///
/// Runs until the job channel is closed and drained.
fn worker_loop(rx: Receiver<Job>, counters: Arc<PoolCounters>) {
    while let Ok(job) = rx.recv() {
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => {
                counters.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("worker job panicked");
            }
        }
    }
}

// Compile-time assertion: ThreadPool must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ThreadPool>();
};
