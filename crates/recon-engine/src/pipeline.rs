//! The compute-and-reconcile orchestrator.
//!
//! [`AsyncPipeline`] ties a subsystem's [`Strategies`] to a worker pool,
//! admission control and a [`TieredCache`]. A request flows through:
//!
//! 1. fingerprint the identity;
//! 2. serve a cache hit without dispatching;
//! 3. attach to an in-flight computation for the same key;
//! 4. consult the negative cache, admission control and pool health;
//! 5. capture a snapshot on the owning thread;
//! 6. compute on a worker, then apply on the owning thread with the
//!    version re-check, caching applied results.
//!
//! Every request ends in a [`Resolution`]: a value or an explicit no-op.
//! Failures and stale applies fall back to synchronous computation on
//! the owning thread, as do timeouts of requests that asked for it.
//! Work the scheduler sheds before it runs resolves as dropped. The
//! in-flight registry entry for a key is removed exactly once per
//! computation, whatever the outcome.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use recon_cache::{CacheStats, TieredCache};
use recon_core::{
    ApplyOutcome, CellPos, Clock, ComputeError, Fingerprint, MonotonicClock, NoOpReason, Priority,
    Resolution, ResultApplier, ResultSource, SnapshotSource, Subsystem, VersionToken,
    WorkerComputation, WorkerPool,
};

use crate::admission::AdmissionController;
use crate::config::{ConfigError, PipelineConfig};
use crate::lock;
use crate::pending::{Handle, PendingSlot, Waited};
use crate::scheduler::TaskSmoothingScheduler;
use crate::throttle::ThrottledLog;

/// Longest single wait inside [`AsyncPipeline::drain_until_idle`].
const IDLE_POLL: Duration = Duration::from_millis(5);

// ── Public types ───────────────────────────────────────────────────

/// The three strategies a subsystem supplies.
pub struct Strategies<S: Subsystem> {
    /// Fingerprints identities and captures snapshots.
    pub source: Arc<dyn SnapshotSource<S>>,
    /// The pure worker-side computation.
    pub computation: Arc<dyn WorkerComputation<S>>,
    /// Applies results with the staleness re-check.
    pub applier: Arc<dyn ResultApplier<S>>,
}

impl<S: Subsystem> Strategies<S> {
    /// Bundle concrete strategy implementations.
    pub fn new(
        source: impl SnapshotSource<S> + 'static,
        computation: impl WorkerComputation<S> + 'static,
        applier: impl ResultApplier<S> + 'static,
    ) -> Self {
        Self {
            source: Arc::new(source),
            computation: Arc::new(computation),
            applier: Arc::new(applier),
        }
    }
}

impl<S: Subsystem> Clone for Strategies<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            computation: Arc::clone(&self.computation),
            applier: Arc::clone(&self.applier),
        }
    }
}

/// What to do with background work rejected by admission control or an
/// unhealthy pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OverloadPolicy {
    /// Compute synchronously on the calling thread and queue the result
    /// for the next drain.
    RunInline,
    /// Shed the work: resolve as [`NoOpReason::Dropped`].
    #[default]
    Drop,
}

/// Answer to a background [`request`](AsyncPipeline::request).
#[derive(Debug)]
pub enum Request<R> {
    /// Resolved without waiting.
    Ready(Resolution<R>),
    /// In flight; resolved on a later drain.
    Pending(Handle<R>),
}

impl<R: Clone> Request<R> {
    /// Whether the request resolved immediately.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The immediate resolution, if any.
    pub fn resolution(&self) -> Option<&Resolution<R>> {
        match self {
            Self::Ready(r) => Some(r),
            Self::Pending(_) => None,
        }
    }

    /// The handle, if the request is in flight.
    pub fn handle(&self) -> Option<&Handle<R>> {
        match self {
            Self::Ready(_) => None,
            Self::Pending(h) => Some(h),
        }
    }

    /// The resolution, waiting up to `timeout` if still in flight.
    pub fn wait(self, timeout: Duration) -> Option<Resolution<R>> {
        match self {
            Self::Ready(r) => Some(r),
            Self::Pending(h) => h.wait(timeout),
        }
    }
}

/// Tally of one [`drain_completions`](AsyncPipeline::drain_completions) pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Completions taken off the channel.
    pub received: u64,
    /// Worker or inline results applied.
    pub applied: u64,
    /// Results rejected by the version check.
    pub stale: u64,
    /// Stale results resubmitted to the pool.
    pub retried: u64,
    /// Background computations given up on after the timeout.
    pub timed_out: u64,
    /// Worker failures.
    pub failed: u64,
    /// Synchronous fallbacks run.
    pub fallbacks: u64,
    /// Computations resolved without a value.
    pub no_ops: u64,
    /// Scheduled or timed-out work resolved as dropped.
    pub dropped: u64,
}

impl DrainReport {
    /// Whether nothing happened.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Add `other` into `self`.
    pub fn merge(&mut self, other: DrainReport) {
        self.received += other.received;
        self.applied += other.applied;
        self.stale += other.stale;
        self.retried += other.retried;
        self.timed_out += other.timed_out;
        self.failed += other.failed;
        self.fallbacks += other.fallbacks;
        self.no_ops += other.no_ops;
        self.dropped += other.dropped;
    }
}

/// Point-in-time pipeline statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineStats {
    /// Pipeline name.
    pub name: String,
    /// Requests through either entry point.
    pub requests: u64,
    /// Requests served from cache.
    pub cache_hits: u64,
    /// Requests that attached to an in-flight computation.
    pub attached: u64,
    /// Computations handed to the pool or scheduler.
    pub submitted: u64,
    /// Results applied to live state.
    pub applied: u64,
    /// Results rejected by the version check.
    pub stale: u64,
    /// Stale results resubmitted.
    pub retried: u64,
    /// Computations that exceeded their timeout.
    pub timeouts: u64,
    /// Worker or fallback failures.
    pub failures: u64,
    /// Synchronous fallbacks run.
    pub fallbacks: u64,
    /// Inline computations after an overload rejection.
    pub inline: u64,
    /// Background requests shed under load.
    pub dropped: u64,
    /// Requests resolved without a value.
    pub no_ops: u64,
    /// Requests short-circuited by the negative cache.
    pub negative_hits: u64,
    /// Computations currently in flight.
    pub pending: usize,
    /// Last observed pool health.
    pub pool_healthy: bool,
    /// Consecutive unhealthy pool observations.
    pub consecutive_unhealthy: u64,
    /// The result cache.
    pub cache: CacheStats,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: Requests={} | Hits={} | Attached={} | Submitted={} | Applied={} | Stale={} | Retried={} | Timeouts={} | Failures={} | Fallbacks={} | Inline={} | Dropped={} | NoOps={} | Negative={} | Pending={} | Healthy={} | ConsecutiveUnhealthy={} | {}",
            self.name,
            self.requests,
            self.cache_hits,
            self.attached,
            self.submitted,
            self.applied,
            self.stale,
            self.retried,
            self.timeouts,
            self.failures,
            self.fallbacks,
            self.inline,
            self.dropped,
            self.no_ops,
            self.negative_hits,
            self.pending,
            self.pool_healthy,
            self.consecutive_unhealthy,
            self.cache,
        )
    }
}

// ── Internals ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    attached: AtomicU64,
    submitted: AtomicU64,
    applied: AtomicU64,
    stale: AtomicU64,
    retried: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
    inline: AtomicU64,
    dropped: AtomicU64,
    no_ops: AtomicU64,
    negative_hits: AtomicU64,
}

/// Outcome of starting a latency-critical computation.
enum Started<S: Subsystem> {
    Running(Arc<InFlight<S>>),
    IdentityGone,
    Refused,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// One in-flight computation. Replaced (same slot) when a stale
/// result is retried.
struct InFlight<S: Subsystem> {
    slot: Arc<PendingSlot<S::Output>>,
    identity: S::Identity,
    version: VersionToken,
    started_at: Instant,
    attempt: u8,
    source: ResultSource,
    policy: OverloadPolicy,
}

impl<S: Subsystem> InFlight<S> {
    fn key(&self) -> Fingerprint {
        self.slot.key()
    }
}

/// Owns a dispatched computation until its job runs. Dropping it
/// unrun (the scheduler evicted, cleared or refused the job) claims the
/// slot and reports the computation on the shed channel.
struct ShedGuard<S: Subsystem> {
    task: Option<Arc<InFlight<S>>>,
    shed: Sender<Arc<InFlight<S>>>,
}

impl<S: Subsystem> ShedGuard<S> {
    fn take(&mut self) -> Option<Arc<InFlight<S>>> {
        self.task.take()
    }
}

impl<S: Subsystem> Drop for ShedGuard<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if task.slot.claim_running() {
                let _ = self.shed.send(task);
            }
        }
    }
}

/// Run `compute`, turning a panic into [`ComputeError::WorkerFailure`].
fn guarded_compute<S: Subsystem>(
    computation: &dyn WorkerComputation<S>,
    snapshot: &S::Snapshot,
) -> Result<S::Output, ComputeError> {
    match panic::catch_unwind(AssertUnwindSafe(|| computation.compute(snapshot))) {
        Ok(result) => result,
        Err(payload) => Err(ComputeError::failure(panic_reason(payload.as_ref()))),
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_owned()
    }
}

// ── AsyncPipeline ──────────────────────────────────────────────────

/// Orchestrates snapshot, worker computation and reconciliation for one
/// subsystem.
///
/// Construct one per partition (or share one across partitions that
/// share a cache). Methods taking `&S::State` or `&mut S::State` must be
/// called on the thread that owns that state.
pub struct AsyncPipeline<S: Subsystem> {
    config: PipelineConfig,
    strategies: Strategies<S>,
    pool: Arc<dyn WorkerPool>,
    admission: Arc<AdmissionController>,
    scheduler: Option<Arc<TaskSmoothingScheduler>>,
    clock: Arc<dyn Clock>,
    cache: TieredCache<S::Output>,
    pending: DashMap<Fingerprint, Arc<InFlight<S>>>,
    done_tx: Sender<Arc<InFlight<S>>>,
    done_rx: Receiver<Arc<InFlight<S>>>,
    shed_tx: Sender<Arc<InFlight<S>>>,
    shed_rx: Receiver<Arc<InFlight<S>>>,
    negative: DashMap<Fingerprint, Instant>,
    rng: Mutex<ChaCha8Rng>,
    log: ThrottledLog,
    counters: Counters,
    consecutive_unhealthy: AtomicU64,
}

impl<S: Subsystem> AsyncPipeline<S> {
    /// Create a pipeline on the monotonic clock.
    pub fn new(
        config: PipelineConfig,
        strategies: Strategies<S>,
        pool: Arc<dyn WorkerPool>,
        admission: Arc<AdmissionController>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, strategies, pool, admission, Arc::new(MonotonicClock))
    }

    /// Create a pipeline whose cache TTLs, background timeouts and
    /// negative-cache ages follow `clock`.
    pub fn with_clock(
        config: PipelineConfig,
        strategies: Strategies<S>,
        pool: Arc<dyn WorkerPool>,
        admission: Arc<AdmissionController>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = TieredCache::with_clock(config.cache.clone(), Arc::clone(&clock))?;
        let log = ThrottledLog::with_clock(config.log_window, Arc::clone(&clock));
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let (shed_tx, shed_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            config,
            strategies,
            pool,
            admission,
            scheduler: None,
            clock,
            cache,
            pending: DashMap::new(),
            done_tx,
            done_rx,
            shed_tx,
            shed_rx,
            negative: DashMap::new(),
            rng: Mutex::new(rng),
            log,
            counters: Counters::default(),
            consecutive_unhealthy: AtomicU64::new(0),
        })
    }

    /// Route background work through `scheduler` instead of straight to
    /// the pool. The scheduler then makes the admission decision.
    pub fn with_scheduler(mut self, scheduler: Arc<TaskSmoothingScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Pipeline name (log key prefix and scheduler category).
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The result cache.
    pub fn cache(&self) -> &TieredCache<S::Output> {
        &self.cache
    }

    /// The admission controller.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Computations currently in flight.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a computation for `key` is in flight.
    pub fn is_pending(&self, key: &Fingerprint) -> bool {
        self.pending.contains_key(key)
    }

    // ── Entry points ────────────────────────────────────────────

    /// Background request. Never waits for a worker.
    ///
    /// Cache hits, no-ops, shed work and inline computations come back
    /// as [`Request::Ready`]; everything else as a [`Request::Pending`]
    /// handle resolved by a later [`drain_completions`](Self::drain_completions).
    pub fn request(
        &self,
        state: &S::State,
        identity: S::Identity,
        priority: Priority,
        policy: OverloadPolicy,
    ) -> Request<S::Output> {
        bump(&self.counters.requests);
        let key = self.strategies.source.fingerprint(&identity);

        if let Some(value) = self.cache.get(&key) {
            bump(&self.counters.cache_hits);
            return Request::Ready(Resolution::Ready {
                value,
                source: ResultSource::Cache,
            });
        }
        if let Some(handle) = self.attach(&key) {
            return Request::Pending(handle);
        }
        if self.negative_blocks(&key) {
            return Request::Ready(self.no_op(NoOpReason::NegativeCached));
        }
        if !self.admit(priority, self.scheduler.is_none()) {
            return Request::Ready(self.overloaded(state, identity, key, policy));
        }
        let Some(captured) = self.strategies.source.capture(state, &identity) else {
            return Request::Ready(self.no_op(NoOpReason::IdentityGone));
        };

        let inflight = Arc::new(InFlight {
            slot: Arc::new(PendingSlot::new(key)),
            identity,
            version: captured.version,
            started_at: self.clock.now(),
            attempt: 0,
            source: ResultSource::Worker,
            policy,
        });
        match self.pending.entry(key) {
            Entry::Occupied(e) => {
                bump(&self.counters.attached);
                return Request::Pending(Handle::new(Arc::clone(&e.get().slot)));
            }
            Entry::Vacant(e) => {
                e.insert(Arc::clone(&inflight));
            }
        }

        let handle = Handle::new(Arc::clone(&inflight.slot));
        if self.dispatch(&inflight, captured.snapshot, priority, true) {
            return Request::Pending(handle);
        }

        self.pending
            .remove_if(&key, |_, v| Arc::ptr_eq(v, &inflight));
        let resolution = self.overloaded(state, inflight.identity.clone(), key, policy);
        inflight.slot.resolve(resolution.clone());
        Request::Ready(resolution)
    }

    /// Latency-critical request: resolve this call, on the owning thread.
    ///
    /// Waits at most `critical_timeout` for the worker (or for an
    /// in-flight computation it attached to), then applies. Timeouts,
    /// failures, stale results, admission rejections and an unhealthy
    /// pool all fall back to synchronous computation.
    pub fn resolve_now(
        &self,
        state: &mut S::State,
        identity: S::Identity,
        priority: Priority,
    ) -> Resolution<S::Output> {
        bump(&self.counters.requests);
        let key = self.strategies.source.fingerprint(&identity);

        if let Some(value) = self.cache.get(&key) {
            bump(&self.counters.cache_hits);
            return Resolution::Ready {
                value,
                source: ResultSource::Cache,
            };
        }

        let existing = self.pending.get(&key).map(|e| Arc::clone(e.value()));
        let inflight = match existing {
            Some(inflight) => {
                bump(&self.counters.attached);
                inflight
            }
            None => {
                if self.negative_blocks(&key) {
                    return self.no_op(NoOpReason::NegativeCached);
                }
                if !self.admit(priority, true) {
                    bump(&self.counters.inline);
                    return self.run_fallback(state, &identity, key, ResultSource::Inline);
                }
                match self.start_direct(state, identity.clone(), key) {
                    Started::Running(inflight) => inflight,
                    Started::IdentityGone => return self.no_op(NoOpReason::IdentityGone),
                    Started::Refused => {
                        bump(&self.counters.inline);
                        return self.run_fallback(state, &identity, key, ResultSource::Inline);
                    }
                }
            }
        };

        let deadline = Instant::now() + self.config.critical_timeout;
        let mut waited = inflight.slot.wait_computed(deadline);
        if matches!(waited, Waited::TimedOut) {
            if inflight.slot.claim_running() {
                bump(&self.counters.timeouts);
                self.log_failure(
                    "timeout",
                    &ComputeError::Timeout {
                        budget: self.config.critical_timeout,
                    },
                );
                let resolution =
                    self.run_fallback(state, &inflight.identity, key, ResultSource::Fallback);
                return self.finish(&inflight, resolution);
            }
            // Lost the race: the result landed between the wait and the claim.
            waited = inflight.slot.wait_computed(Instant::now());
        }
        match waited {
            Waited::Computed(result) => {
                let mut scratch = DrainReport::default();
                match self.settle(state, &inflight, result, false, &mut scratch) {
                    Some(resolution) => resolution,
                    None => self.run_fallback(state, &inflight.identity, key, ResultSource::Fallback),
                }
            }
            Waited::Resolved(resolution) => resolution,
            Waited::TimedOut => {
                // Claimed elsewhere and not yet resolved; compute our own answer.
                self.run_fallback(state, &inflight.identity, key, ResultSource::Fallback)
            }
        }
    }

    /// Apply finished background computations on the owning thread.
    ///
    /// Results are applied in completion-channel order. Work the
    /// scheduler shed before running it resolves as dropped. Background
    /// computations older than `background_timeout` are given up on:
    /// `Drop`-policy requests resolve as dropped, the rest by synchronous
    /// fallback, at most `max_fallbacks_per_drain` per call.
    pub fn drain_completions(&self, state: &mut S::State) -> DrainReport {
        let mut report = DrainReport::default();
        while let Ok(inflight) = self.done_rx.try_recv() {
            self.process(state, inflight, &mut report);
        }
        while let Ok(inflight) = self.shed_rx.try_recv() {
            self.retire_shed(&inflight, &mut report);
        }
        self.expire_overdue(state, &mut report);
        report
    }

    /// Drain repeatedly until nothing is in flight or `deadline` passes.
    pub fn drain_until_idle(&self, state: &mut S::State, deadline: Instant) -> DrainReport {
        let mut report = self.drain_completions(state);
        while !self.pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.done_rx.recv_timeout((deadline - now).min(IDLE_POLL)) {
                Ok(inflight) => self.process(state, inflight, &mut report),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            report.merge(self.drain_completions(state));
        }
        report
    }

    // ── Invalidation and health ─────────────────────────────────

    /// Drop the cached result and any negative-cache entry for `key`.
    ///
    /// In-flight work for the key is left to the version check.
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.negative.remove(key);
        self.cache.invalidate(key)
    }

    /// Drop cached and negative-cached results anchored within `radius`
    /// (Manhattan) of `center`. Returns the number of cache entries removed.
    pub fn invalidate_region(&self, center: CellPos, radius: u64) -> usize {
        self.negative
            .retain(|k, _| !k.anchor().is_some_and(|pos| pos.manhattan(&center) <= radius));
        self.cache.invalidate_region(center, radius)
    }

    /// Delegate to the pool's health check, tracking consecutive
    /// unhealthy observations.
    pub fn is_healthy(&self) -> bool {
        let healthy = self.pool.is_healthy();
        if healthy {
            self.consecutive_unhealthy.store(0, Ordering::Relaxed);
        } else {
            let n = self.consecutive_unhealthy.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 {
                tracing::debug!(pipeline = %self.config.name, "worker pool unhealthy");
            }
        }
        healthy
    }

    /// Length of the current run of unhealthy pool observations.
    ///
    /// Callers may disable the subsystem once this grows large.
    pub fn consecutive_unhealthy(&self) -> u64 {
        self.consecutive_unhealthy.load(Ordering::Relaxed)
    }

    /// Current statistics.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        PipelineStats {
            name: self.config.name.clone(),
            requests: get(&c.requests),
            cache_hits: get(&c.cache_hits),
            attached: get(&c.attached),
            submitted: get(&c.submitted),
            applied: get(&c.applied),
            stale: get(&c.stale),
            retried: get(&c.retried),
            timeouts: get(&c.timeouts),
            failures: get(&c.failures),
            fallbacks: get(&c.fallbacks),
            inline: get(&c.inline),
            dropped: get(&c.dropped),
            no_ops: get(&c.no_ops),
            negative_hits: get(&c.negative_hits),
            pending: self.pending.len(),
            pool_healthy: self.pool.is_healthy(),
            consecutive_unhealthy: self.consecutive_unhealthy(),
            cache: self.cache.stats(),
        }
    }

    /// Per-key counts of throttled failure logs.
    pub fn failure_log_counts(&self) -> Vec<(String, u64)> {
        self.log.counts()
    }

    // ── Admission ───────────────────────────────────────────────

    /// Whether to take the worker path. `sample` controls whether the
    /// stochastic admission check runs here or is left to the scheduler.
    fn admit(&self, priority: Priority, sample: bool) -> bool {
        if !self.is_healthy() {
            return false;
        }
        if !sample {
            return true;
        }
        match priority {
            Priority::Critical => true,
            Priority::Low if self.admission.should_skip_low_priority() => false,
            _ => self.admission.should_submit(),
        }
    }

    fn attach(&self, key: &Fingerprint) -> Option<Handle<S::Output>> {
        let slot = self.pending.get(key).map(|e| Arc::clone(&e.slot))?;
        bump(&self.counters.attached);
        Some(Handle::new(slot))
    }

    fn negative_blocks(&self, key: &Fingerprint) -> bool {
        let Some(ttl) = self.config.negative_ttl else {
            return false;
        };
        let Some(failed_at) = self.negative.get(key).map(|e| *e.value()) else {
            return false;
        };
        if self.clock.now().saturating_duration_since(failed_at) > ttl {
            self.negative.remove(key);
            return false;
        }
        if lock(&self.rng).gen::<f64>() < self.config.retry_probability {
            return false;
        }
        bump(&self.counters.negative_hits);
        true
    }

    fn overloaded(
        &self,
        state: &S::State,
        identity: S::Identity,
        key: Fingerprint,
        policy: OverloadPolicy,
    ) -> Resolution<S::Output> {
        match policy {
            OverloadPolicy::Drop => {
                bump(&self.counters.dropped);
                self.no_op(NoOpReason::Dropped)
            }
            OverloadPolicy::RunInline => self.run_inline(state, identity, key),
        }
    }

    /// Compute on the calling thread and queue the result for apply.
    fn run_inline(
        &self,
        state: &S::State,
        identity: S::Identity,
        key: Fingerprint,
    ) -> Resolution<S::Output> {
        bump(&self.counters.inline);
        let Some(captured) = self.strategies.source.capture(state, &identity) else {
            return self.no_op(NoOpReason::IdentityGone);
        };
        match guarded_compute(self.strategies.computation.as_ref(), &captured.snapshot) {
            Ok(value) => {
                let inflight = Arc::new(InFlight {
                    slot: Arc::new(PendingSlot::computed(key, Ok(value.clone()))),
                    identity,
                    version: captured.version,
                    started_at: self.clock.now(),
                    attempt: 0,
                    source: ResultSource::Inline,
                    policy: OverloadPolicy::RunInline,
                });
                if let Entry::Vacant(e) = self.pending.entry(key) {
                    e.insert(Arc::clone(&inflight));
                }
                // The receiver lives as long as `self`.
                let _ = self.done_tx.send(inflight);
                Resolution::Ready {
                    value,
                    source: ResultSource::Inline,
                }
            }
            Err(err) => {
                bump(&self.counters.failures);
                self.log_failure("inline", &err);
                self.record_negative(key);
                self.no_op(NoOpReason::Failed(err))
            }
        }
    }

    // ── Dispatch ────────────────────────────────────────────────

    /// Hand `inflight` to the scheduler (background, when attached) or
    /// the pool. Returns false if nothing accepted it.
    fn dispatch(
        &self,
        inflight: &Arc<InFlight<S>>,
        snapshot: S::Snapshot,
        priority: Priority,
        background: bool,
    ) -> bool {
        let computation = Arc::clone(&self.strategies.computation);
        let done = self.done_tx.clone();
        let mut guard = ShedGuard {
            task: Some(Arc::clone(inflight)),
            shed: self.shed_tx.clone(),
        };
        let job = Box::new(move || {
            let Some(task) = guard.take() else {
                return;
            };
            if task.slot.is_cancelled() {
                return;
            }
            let result = guarded_compute(computation.as_ref(), &snapshot);
            if task.slot.complete(result) {
                let _ = done.send(task);
            }
        });

        let accepted = match (&self.scheduler, background) {
            (Some(scheduler), true) => scheduler.submit(job, priority, &self.config.name),
            _ => self.pool.try_submit(job).is_ok(),
        };
        if accepted {
            bump(&self.counters.submitted);
        }
        accepted
    }

    /// Register and submit a latency-critical computation straight to
    /// the pool.
    fn start_direct(&self, state: &S::State, identity: S::Identity, key: Fingerprint) -> Started<S> {
        let Some(captured) = self.strategies.source.capture(state, &identity) else {
            return Started::IdentityGone;
        };
        let inflight = Arc::new(InFlight {
            slot: Arc::new(PendingSlot::new(key)),
            identity,
            version: captured.version,
            started_at: self.clock.now(),
            attempt: 0,
            source: ResultSource::Worker,
            policy: OverloadPolicy::RunInline,
        });
        self.pending.insert(key, Arc::clone(&inflight));
        if self.dispatch(&inflight, captured.snapshot, Priority::Critical, false) {
            Started::Running(inflight)
        } else {
            self.pending
                .remove_if(&key, |_, v| Arc::ptr_eq(v, &inflight));
            Started::Refused
        }
    }

    // ── Reconciliation ──────────────────────────────────────────

    fn process(&self, state: &mut S::State, inflight: Arc<InFlight<S>>, report: &mut DrainReport) {
        let Some(result) = inflight.slot.take_computed() else {
            return;
        };
        report.received += 1;
        self.settle(state, &inflight, result, true, report);
    }

    /// Apply a claimed worker result, or fall back.
    fn settle(
        &self,
        state: &mut S::State,
        inflight: &Arc<InFlight<S>>,
        result: Result<S::Output, ComputeError>,
        allow_retry: bool,
        report: &mut DrainReport,
    ) -> Option<Resolution<S::Output>> {
        let key = inflight.key();
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                report.failed += 1;
                bump(&self.counters.failures);
                self.log_failure("compute", &err);
                report.fallbacks += 1;
                let resolution =
                    self.run_fallback(state, &inflight.identity, key, ResultSource::Fallback);
                if !resolution.is_ready() {
                    report.no_ops += 1;
                }
                return Some(self.finish(inflight, resolution));
            }
        };

        match self
            .strategies
            .applier
            .apply(state, &inflight.identity, &value, inflight.version)
        {
            ApplyOutcome::Applied => {
                report.applied += 1;
                bump(&self.counters.applied);
                self.store(key, &value);
                Some(self.finish(
                    inflight,
                    Resolution::Ready {
                        value,
                        source: inflight.source,
                    },
                ))
            }
            ApplyOutcome::Stale => {
                report.stale += 1;
                bump(&self.counters.stale);
                tracing::trace!(pipeline = %self.config.name, %key, "stale result discarded");
                if allow_retry && self.config.retry_stale_once && inflight.attempt == 0 {
                    match self.retry(state, inflight) {
                        Some(true) => {
                            // Resolved when the retried computation drains.
                            report.retried += 1;
                            return None;
                        }
                        Some(false) => {}
                        None => {
                            report.no_ops += 1;
                            let resolution = self.no_op(NoOpReason::IdentityGone);
                            return Some(self.finish(inflight, resolution));
                        }
                    }
                }
                report.fallbacks += 1;
                let resolution =
                    self.run_fallback(state, &inflight.identity, key, ResultSource::Fallback);
                if !resolution.is_ready() {
                    report.no_ops += 1;
                }
                Some(self.finish(inflight, resolution))
            }
        }
    }

    /// Recapture and resubmit after a stale apply. `Some(true)` when
    /// resubmitted, `Some(false)` when the pool refused, `None` when the
    /// identity is gone.
    fn retry(&self, state: &S::State, stale: &Arc<InFlight<S>>) -> Option<bool> {
        let captured = self.strategies.source.capture(state, &stale.identity)?;
        let key = stale.key();
        let next = Arc::new(InFlight {
            slot: Arc::clone(&stale.slot),
            identity: stale.identity.clone(),
            version: captured.version,
            started_at: self.clock.now(),
            attempt: stale.attempt.saturating_add(1),
            source: stale.source,
            policy: stale.policy,
        });
        stale.slot.rearm();
        self.pending.insert(key, Arc::clone(&next));
        if self.dispatch(&next, captured.snapshot, Priority::High, false) {
            bump(&self.counters.retried);
            return Some(true);
        }
        // Refused: reclaim the slot and restore the original entry so the
        // caller's fallback retires it.
        next.slot.claim_running();
        self.pending.insert(key, Arc::clone(stale));
        Some(false)
    }

    /// Resolve a computation whose job was dropped unrun. A refusal
    /// during dispatch has already retired the entry, so only a live
    /// registry entry counts.
    fn retire_shed(&self, inflight: &Arc<InFlight<S>>, report: &mut DrainReport) {
        let key = inflight.key();
        if self
            .pending
            .remove_if(&key, |_, v| Arc::ptr_eq(v, inflight))
            .is_none()
        {
            return;
        }
        tracing::trace!(pipeline = %self.config.name, %key, "scheduled work shed");
        report.dropped += 1;
        report.no_ops += 1;
        bump(&self.counters.dropped);
        inflight.slot.resolve(self.no_op(NoOpReason::Dropped));
    }

    /// Give up on background computations running past their budget,
    /// oldest first.
    fn expire_overdue(&self, state: &mut S::State, report: &mut DrainReport) {
        let now = self.clock.now();
        let budget = self.config.background_timeout;
        let mut overdue: Vec<Arc<InFlight<S>>> = self
            .pending
            .iter()
            .filter(|e| now.saturating_duration_since(e.started_at) > budget)
            .map(|e| Arc::clone(e.value()))
            .collect();
        overdue.sort_by_key(|inflight| inflight.started_at);

        let mut fallbacks = 0;
        let mut deferred = 0usize;
        for inflight in overdue {
            let shed = inflight.policy == OverloadPolicy::Drop;
            if !shed && fallbacks >= self.config.max_fallbacks_per_drain {
                deferred += 1;
                continue;
            }
            if !inflight.slot.claim_running() {
                // Completed in the meantime; the channel has it.
                continue;
            }
            report.timed_out += 1;
            bump(&self.counters.timeouts);
            self.log_failure("timeout", &ComputeError::Timeout { budget });
            if shed {
                report.dropped += 1;
                report.no_ops += 1;
                bump(&self.counters.dropped);
                let resolution = self.no_op(NoOpReason::Dropped);
                self.finish(&inflight, resolution);
                continue;
            }
            fallbacks += 1;
            report.fallbacks += 1;
            let resolution =
                self.run_fallback(state, &inflight.identity, inflight.key(), ResultSource::Fallback);
            if !resolution.is_ready() {
                report.no_ops += 1;
            }
            self.finish(&inflight, resolution);
        }
        if deferred > 0 {
            tracing::debug!(
                pipeline = %self.config.name,
                fallbacks,
                deferred,
                "timeout fallbacks capped for this drain"
            );
        }
    }

    /// Synchronous capture, compute and apply on the owning thread.
    fn run_fallback(
        &self,
        state: &mut S::State,
        identity: &S::Identity,
        key: Fingerprint,
        source: ResultSource,
    ) -> Resolution<S::Output> {
        bump(&self.counters.fallbacks);
        let Some(captured) = self.strategies.source.capture(state, identity) else {
            return self.no_op(NoOpReason::IdentityGone);
        };
        let value = match guarded_compute(self.strategies.computation.as_ref(), &captured.snapshot)
        {
            Ok(value) => value,
            Err(err) => {
                bump(&self.counters.failures);
                self.log_failure("fallback", &err);
                self.record_negative(key);
                return self.no_op(NoOpReason::Failed(err));
            }
        };
        match self
            .strategies
            .applier
            .apply(state, identity, &value, captured.version)
        {
            ApplyOutcome::Applied => {
                bump(&self.counters.applied);
                self.store(key, &value);
                Resolution::Ready { value, source }
            }
            ApplyOutcome::Stale => {
                bump(&self.counters.stale);
                self.no_op(NoOpReason::Failed(ComputeError::Stale))
            }
        }
    }

    /// Retire an in-flight entry and publish its resolution.
    fn finish(
        &self,
        inflight: &Arc<InFlight<S>>,
        resolution: Resolution<S::Output>,
    ) -> Resolution<S::Output> {
        let key = inflight.key();
        self.pending.remove_if(&key, |_, v| Arc::ptr_eq(v, inflight));
        inflight.slot.resolve(resolution.clone());
        resolution
    }

    fn store(&self, key: Fingerprint, value: &S::Output) {
        self.negative.remove(&key);
        self.cache.put(key, value.clone());
    }

    fn record_negative(&self, key: Fingerprint) {
        if self.config.negative_ttl.is_some() {
            self.negative.insert(key, self.clock.now());
        }
    }

    fn no_op(&self, reason: NoOpReason) -> Resolution<S::Output> {
        bump(&self.counters.no_ops);
        Resolution::NoOp(reason)
    }

    fn log_failure(&self, op: &str, err: &ComputeError) {
        let key = format!("{}:{op}", self.config.name);
        if let Some(suppressed) = self.log.check(&key) {
            tracing::warn!(
                pipeline = %self.config.name,
                op,
                error = %err,
                suppressed,
                "computation failed, resolving synchronously"
            );
        }
    }
}

impl<S: Subsystem> fmt::Debug for AsyncPipeline<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPipeline")
            .field("name", &self.config.name)
            .field("pending", &self.pending.len())
            .field("cache_len", &self.cache.len())
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

// Compile-time assertion: the pipeline is shareable across threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    struct Probe;
    impl Subsystem for Probe {
        type Identity = u32;
        type State = ();
        type Snapshot = u32;
        type Output = u32;
    }
    assert::<AsyncPipeline<Probe>>();
};
