//! Owning threads: the only threads allowed to mutate partition state.
//!
//! An [`OwnerThread`] takes its state by move, runs mailbox jobs in
//! submission order, and (when given a [`TickHook`]) ticks at the
//! configured rate, recording each tick's duration in a
//! [`TickRateTracker`]. [`PartitionedExecutor`] runs one owner per
//! [`PartitionId`] and implements [`OwnerExecutor`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use indexmap::IndexMap;
use recon_core::{OwnerExecutor, OwnerJob, PartitionId, SubmitError};

use crate::config::{ConfigError, OwnerConfig};
use crate::lock;
use crate::metrics::TickRateTracker;

/// Per-tick context handed to a [`TickHook`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickInfo {
    /// 1-based tick number.
    pub tick: u64,
    /// When this tick started.
    pub started_at: Instant,
    /// Nominal tick length.
    pub budget: Duration,
}

/// Work run once per tick on the owning thread.
pub type TickHook<S> = Box<dyn FnMut(&mut S, &TickInfo) + Send + 'static>;

#[derive(Debug, Default)]
struct OwnerCounters {
    executed: AtomicU64,
    panicked: AtomicU64,
}

/// A named thread that exclusively owns a value of type `S`.
pub struct OwnerThread<S: Send + 'static> {
    name: String,
    tx: Option<Sender<OwnerJob<S>>>,
    handle: Option<JoinHandle<S>>,
    metrics: Arc<TickRateTracker>,
    counters: Arc<OwnerCounters>,
}

impl<S: Send + 'static> OwnerThread<S> {
    /// Move `state` onto a new thread named after `config.name`.
    pub fn spawn(
        state: S,
        config: OwnerConfig,
        hook: Option<TickHook<S>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let budget = config.tick_budget();
        let (tx, rx) = crossbeam_channel::bounded(config.mailbox_capacity);
        let metrics = Arc::new(TickRateTracker::new(budget));
        let counters = Arc::new(OwnerCounters::default());

        let owner = OwnerLoop {
            state,
            rx,
            hook,
            budget,
            metrics: Arc::clone(&metrics),
            counters: Arc::clone(&counters),
        };
        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || owner.run())
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: format!("{}: {e}", config.name),
            })?;

        Ok(Self {
            name: config.name,
            tx: Some(tx),
            handle: Some(handle),
            metrics,
            counters,
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `job`. Jobs run in submission order.
    pub fn run_on_owner(&self, job: OwnerJob<S>) -> Result<(), SubmitError> {
        let Some(tx) = &self.tx else {
            return Err(SubmitError::Shutdown);
        };
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::ChannelFull,
            TrySendError::Disconnected(_) => SubmitError::Shutdown,
        })
    }

    /// Run `f` on the owning thread and wait for its return value.
    ///
    /// Must not be called from the owning thread itself. A panic inside
    /// `f` is reported as [`SubmitError::Shutdown`].
    pub fn call<R, F>(&self, f: F) -> Result<R, SubmitError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.run_on_owner(Box::new(move |state| {
            let _ = reply_tx.send(f(state));
        }))?;
        reply_rx.recv().map_err(|_| SubmitError::Shutdown)
    }

    /// Tick timing for this owner.
    pub fn metrics(&self) -> &Arc<TickRateTracker> {
        &self.metrics
    }

    /// Jobs run to completion.
    pub fn jobs_executed(&self) -> u64 {
        self.counters.executed.load(Ordering::Relaxed)
    }

    /// Jobs that panicked.
    pub fn jobs_panicked(&self) -> u64 {
        self.counters.panicked.load(Ordering::Relaxed)
    }

    /// Jobs waiting in the mailbox.
    pub fn queued(&self) -> usize {
        self.tx.as_ref().map_or(0, Sender::len)
    }

    /// Stop accepting jobs, run the ones already queued, join the thread
    /// and hand back the state. `None` if the thread panicked.
    pub fn shutdown(mut self) -> Option<S> {
        self.stop()
    }

    fn stop(&mut self) -> Option<S> {
        self.tx.take();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(state) => Some(state),
            Err(_) => {
                tracing::warn!(owner = %self.name, "owning thread panicked");
                None
            }
        }
    }
}

impl<S: Send + 'static> Drop for OwnerThread<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<S: Send + 'static> fmt::Debug for OwnerThread<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerThread")
            .field("name", &self.name)
            .field("queued", &self.queued())
            .field("executed", &self.jobs_executed())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

// ── Owner loop ─────────────────────────────────────────────────────

struct OwnerLoop<S> {
    state: S,
    rx: Receiver<OwnerJob<S>>,
    hook: Option<TickHook<S>>,
    budget: Duration,
    metrics: Arc<TickRateTracker>,
    counters: Arc<OwnerCounters>,
}

impl<S> OwnerLoop<S> {
    /// Runs until every sender is gone and the mailbox is empty, then
    /// returns the state.
    fn run(mut self) -> S {
        if self.hook.is_none() {
            while let Ok(job) = self.rx.recv() {
                self.run_job(job);
            }
            return self.state;
        }

        let mut tick = 0u64;
        let mut next_tick = Instant::now();
        let mut busy = Duration::ZERO;
        loop {
            let now = Instant::now();
            if now >= next_tick {
                tick += 1;
                let hook_time = self.run_hook(tick, now);
                self.metrics.record_tick(hook_time + busy);
                busy = Duration::ZERO;
                // Overrunning ticks are not caught up.
                next_tick = (now + self.budget).max(Instant::now());
                continue;
            }
            match self.rx.recv_timeout(next_tick - now) {
                Ok(job) => {
                    let start = Instant::now();
                    self.run_job(job);
                    busy += start.elapsed();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.state
    }

    fn run_hook(&mut self, tick: u64, started_at: Instant) -> Duration {
        let info = TickInfo {
            tick,
            started_at,
            budget: self.budget,
        };
        if let Some(hook) = self.hook.as_mut() {
            let state = &mut self.state;
            if panic::catch_unwind(AssertUnwindSafe(|| hook(state, &info))).is_err() {
                tracing::warn!(tick, "tick hook panicked");
            }
        }
        started_at.elapsed()
    }

    fn run_job(&mut self, job: OwnerJob<S>) {
        let state = &mut self.state;
        match panic::catch_unwind(AssertUnwindSafe(|| job(state))) {
            Ok(()) => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("owner job panicked");
            }
        }
    }
}

// ── PartitionedExecutor ────────────────────────────────────────────

/// One [`OwnerThread`] per partition.
///
/// Threads are named `{config.name}-{partition}`. Jobs for the same
/// partition run in submission order; jobs for different partitions run
/// concurrently.
pub struct PartitionedExecutor<S: Send + 'static> {
    config: OwnerConfig,
    owners: Mutex<IndexMap<PartitionId, OwnerThread<S>>>,
}

impl<S: Send + 'static> PartitionedExecutor<S> {
    /// An executor with no partitions. Each partition's thread uses
    /// `config` with its name suffixed by the partition id.
    pub fn new(config: OwnerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            owners: Mutex::new(IndexMap::new()),
        })
    }

    /// Spawn an owner for `partition`.
    ///
    /// An existing owner for the partition is shut down first and its
    /// state returned.
    pub fn add_partition(
        &self,
        partition: PartitionId,
        state: S,
        hook: Option<TickHook<S>>,
    ) -> Result<Option<S>, ConfigError> {
        let config = OwnerConfig {
            name: format!("{}-{partition}", self.config.name),
            ..self.config.clone()
        };
        let owner = OwnerThread::spawn(state, config, hook)?;
        let previous = lock(&self.owners).insert(partition, owner);
        tracing::debug!(%partition, replaced = previous.is_some(), "partition added");
        Ok(previous.and_then(OwnerThread::shutdown))
    }

    /// Shut down the owner of `partition` and return its state.
    pub fn remove_partition(&self, partition: PartitionId) -> Option<S> {
        let owner = lock(&self.owners).shift_remove(&partition)?;
        owner.shutdown()
    }

    /// Registered partitions in insertion order.
    pub fn partitions(&self) -> Vec<PartitionId> {
        lock(&self.owners).keys().copied().collect()
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        lock(&self.owners).len()
    }

    /// Whether no partitions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tick timing for `partition`.
    pub fn metrics(&self, partition: PartitionId) -> Option<Arc<TickRateTracker>> {
        lock(&self.owners)
            .get(&partition)
            .map(|o| Arc::clone(o.metrics()))
    }

    /// Run `f` on the owner of `partition` and wait for the result.
    pub fn call<R, F>(&self, partition: PartitionId, f: F) -> Result<R, SubmitError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.run_on_owner(
            partition,
            Box::new(move |state| {
                let _ = reply_tx.send(f(state));
            }),
        )?;
        reply_rx.recv().map_err(|_| SubmitError::Shutdown)
    }

    /// Shut down every owner, returning the states in partition order.
    pub fn shutdown(&self) -> Vec<(PartitionId, S)> {
        let owners = std::mem::take(&mut *lock(&self.owners));
        owners
            .into_iter()
            .filter_map(|(id, owner)| owner.shutdown().map(|s| (id, s)))
            .collect()
    }
}

impl<S: Send + 'static> OwnerExecutor<S> for PartitionedExecutor<S> {
    fn run_on_owner(&self, partition: PartitionId, job: OwnerJob<S>) -> Result<(), SubmitError> {
        match lock(&self.owners).get(&partition) {
            Some(owner) => owner.run_on_owner(job),
            None => Err(SubmitError::UnknownPartition { partition }),
        }
    }
}

impl<S: Send + 'static> fmt::Debug for PartitionedExecutor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedExecutor")
            .field("config", &self.config)
            .field("partitions", &self.partitions())
            .finish()
    }
}
