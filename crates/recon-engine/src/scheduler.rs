//! Priority-ordered smoothing of background work across ticks.
//!
//! [`TaskSmoothingScheduler`] holds a bounded queue ordered by
//! `(priority, submission sequence)` and hands at most a per-tick budget
//! of tasks to the worker pool. The budget scales with the last reported
//! TPS so a struggling server dispatches less. Dispatch runs either
//! cooperatively through [`dispatch_cycle`](TaskSmoothingScheduler::dispatch_cycle)
//! or on a dedicated `recon-smoothing` thread started with
//! [`start`](TaskSmoothingScheduler::start).

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use recon_core::{ComputeError, Job, Priority, WorkerPool};
use smallvec::SmallVec;

use crate::admission::AdmissionController;
use crate::config::{ConfigError, SchedulerConfig};
use crate::lock;

/// Tasks popped per cycle without spilling to the heap.
const BATCH_INLINE: usize = 32;

/// TPS assumed until the first [`update_performance`](TaskSmoothingScheduler::update_performance).
const DEFAULT_TPS: f64 = 20.0;

struct SmoothTask {
    payload: Job,
    priority: Priority,
    seq: u64,
    category: Arc<CategoryCounters>,
}

#[derive(Debug, Default)]
struct CategoryCounters {
    submitted: AtomicU64,
    executed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    failed: AtomicU64,
}

// ── Stats ──────────────────────────────────────────────────────────

/// Per-category counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryStats {
    /// Category name given at submission.
    pub category: String,
    /// Submissions (accepted or not).
    pub submitted: u64,
    /// Tasks that ran to completion.
    pub executed: u64,
    /// Tasks rejected, evicted or discarded.
    pub dropped: u64,
    /// Tasks that panicked.
    pub failed: u64,
}

/// Point-in-time scheduler statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerStats {
    /// Tasks waiting.
    pub queued: usize,
    /// Queue capacity.
    pub capacity: usize,
    /// Submissions, accepted or not.
    pub submitted: u64,
    /// Tasks that ran to completion.
    pub executed: u64,
    /// Tasks rejected, evicted or discarded.
    pub dropped: u64,
    /// Tasks evicted to make room for Critical work.
    pub evicted: u64,
    /// Tasks that panicked.
    pub failed: u64,
    /// Tasks handed to the pool since the last tick.
    pub dispatched_this_tick: usize,
    /// Current per-tick budget.
    pub budget: usize,
    /// Last reported TPS.
    pub tps: f64,
    /// Last reported MSPT.
    pub mspt: f64,
}

impl SchedulerStats {
    /// Queue occupancy as a percentage.
    pub fn usage_percent(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.queued as f64 * 100.0 / self.capacity as f64
        }
    }
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TaskSmoothing: Queue={}/{} | Submitted={} | Executed={} | Dropped={} | Rate={}/{}/tick | TPS={:.1} | MSPT={:.1}",
            self.queued,
            self.capacity,
            self.submitted,
            self.executed,
            self.dropped,
            self.dispatched_this_tick,
            self.budget,
            self.tps,
            self.mspt,
        )
    }
}

// ── Shared state ───────────────────────────────────────────────────

struct Shared {
    config: SchedulerConfig,
    admission: Arc<AdmissionController>,
    pool: Arc<dyn WorkerPool>,
    queue: Mutex<BTreeMap<(Priority, u64), SmoothTask>>,
    available: Condvar,
    next_seq: AtomicU64,
    counters: Arc<Counters>,
    categories: DashMap<String, Arc<CategoryCounters>>,
    dispatched_this_tick: AtomicUsize,
    tps_bits: AtomicU64,
    mspt_bits: AtomicU64,
    shutdown: AtomicBool,
}

impl Shared {
    fn tps(&self) -> f64 {
        f64::from_bits(self.tps_bits.load(Ordering::Acquire))
    }

    fn budget(&self) -> usize {
        let tps = self.tps();
        // Scale factor as a ratio: x1.5, x1.0, x0.7, x0.5.
        let (num, den) = if tps >= 19.5 {
            (3, 2)
        } else if tps >= 18.0 {
            (1, 1)
        } else if tps >= 15.0 {
            (7, 10)
        } else {
            (1, 2)
        };
        (self.config.max_tasks_per_tick * num / den).max(1)
    }

    fn category(&self, name: &str) -> Arc<CategoryCounters> {
        if let Some(c) = self.categories.get(name) {
            return Arc::clone(c.value());
        }
        let entry = self
            .categories
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CategoryCounters::default()));
        Arc::clone(entry.value())
    }

    fn drop_task(&self, task: &SmoothTask) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        task.category.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn dispatch_cycle(&self) -> usize {
        let budget = self.budget();
        let already = self.dispatched_this_tick.load(Ordering::Acquire);
        let remaining = budget.saturating_sub(already);
        if remaining == 0 {
            return 0;
        }

        let mut batch: SmallVec<[SmoothTask; BATCH_INLINE]> = SmallVec::new();
        {
            let mut queue = lock(&self.queue);
            while batch.len() < remaining {
                match queue.pop_first() {
                    Some((_, task)) => batch.push(task),
                    None => break,
                }
            }
        }

        let mut dispatched = 0;
        let mut tasks = batch.into_iter();
        while let Some(task) = tasks.next() {
            let SmoothTask {
                payload,
                priority,
                seq,
                category,
            } = task;
            let cell = Arc::new(Mutex::new(Some(payload)));
            let job = wrap(Arc::clone(&cell), Arc::clone(&self.counters), Arc::clone(&category));
            match self.pool.try_submit(job) {
                Ok(()) => dispatched += 1,
                Err(err) => {
                    let Some(payload) = lock(&cell).take() else {
                        continue;
                    };
                    let task = SmoothTask {
                        payload,
                        priority,
                        seq,
                        category,
                    };
                    match err {
                        ComputeError::QueueSaturated => {
                            let mut queue = lock(&self.queue);
                            queue.insert((task.priority, task.seq), task);
                            for rest in tasks.by_ref() {
                                queue.insert((rest.priority, rest.seq), rest);
                            }
                            break;
                        }
                        _ => self.drop_task(&task),
                    }
                }
            }
        }

        self.dispatched_this_tick.fetch_add(dispatched, Ordering::AcqRel);
        dispatched
    }
}

/// Wrap a queued payload so the worker counts its outcome.
///
/// The payload lives in `cell` until a worker runs it, so a refused
/// submission can take it back and requeue it.
fn wrap(cell: Arc<Mutex<Option<Job>>>, counters: Arc<Counters>, category: Arc<CategoryCounters>) -> Job {
    Box::new(move || {
        let Some(payload) = lock(&cell).take() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(payload)) {
            Ok(()) => {
                counters.executed.fetch_add(1, Ordering::Relaxed);
                category.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                category.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("smoothed task panicked");
            }
        }
    })
}

// ── TaskSmoothingScheduler ─────────────────────────────────────────

/// Bounded priority queue feeding a worker pool at an adaptive rate.
///
/// Admission decisions come from the shared [`AdmissionController`];
/// [`update_performance`](Self::update_performance) forwards MSPT to it.
pub struct TaskSmoothingScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSmoothingScheduler {
    /// Create a scheduler. No thread is started until [`start`](Self::start).
    pub fn new(
        config: SchedulerConfig,
        admission: Arc<AdmissionController>,
        pool: Arc<dyn WorkerPool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                admission,
                pool,
                queue: Mutex::new(BTreeMap::new()),
                available: Condvar::new(),
                next_seq: AtomicU64::new(0),
                counters: Arc::new(Counters::default()),
                categories: DashMap::new(),
                dispatched_this_tick: AtomicUsize::new(0),
                tps_bits: AtomicU64::new(DEFAULT_TPS.to_bits()),
                mspt_bits: AtomicU64::new(0f64.to_bits()),
                shutdown: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// The admission controller consulted on submit.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.shared.admission
    }

    /// Queue `task` for background dispatch.
    ///
    /// Returns `false` when the task was rejected: Low work while the
    /// controller is shedding it, non-Critical work failing the
    /// stochastic admission check, or non-Critical work arriving at a
    /// full queue. A Critical task arriving at a full queue evicts the
    /// lowest-priority, most recently queued task instead.
    pub fn submit(&self, task: Job, priority: Priority, category: &str) -> bool {
        let shared = &self.shared;
        let counters = shared.category(category);
        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        let reject = |reason: &'static str| {
            shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%priority, category, reason, "task rejected");
            false
        };

        if shared.shutdown.load(Ordering::Acquire) {
            return reject("shutdown");
        }
        if priority == Priority::Low && shared.admission.should_skip_low_priority() {
            return reject("low priority shed");
        }
        if priority != Priority::Critical && !shared.admission.should_submit() {
            return reject("admission");
        }

        let mut queue = lock(&shared.queue);
        if queue.len() >= shared.config.max_queue_size {
            if priority != Priority::Critical {
                drop(queue);
                return reject("queue full");
            }
            if let Some((_, victim)) = queue.pop_last() {
                shared.drop_task(&victim);
                shared.counters.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    evicted = %victim.priority,
                    category,
                    "queue full, evicted task for critical work"
                );
            }
        }
        let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
        queue.insert(
            (priority, seq),
            SmoothTask {
                payload: task,
                priority,
                seq,
                category: counters,
            },
        );
        drop(queue);
        shared.available.notify_one();
        true
    }

    /// Run one dispatch pass on the calling thread.
    ///
    /// Hands up to the remaining per-tick budget to the pool in priority
    /// order and returns how many were accepted. Tasks the pool refuses
    /// as saturated go back in the queue in their original order.
    pub fn dispatch_cycle(&self) -> usize {
        self.shared.dispatch_cycle()
    }

    /// Spawn the dedicated `recon-smoothing` dispatch thread.
    ///
    /// Calling it again while the thread runs is a no-op.
    pub fn start(&self) -> Result<(), ConfigError> {
        let mut slot = lock(&self.thread);
        if slot.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("recon-smoothing".into())
            .spawn(move || dispatch_loop(shared))
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: format!("recon-smoothing: {e}"),
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Whether the dispatch thread is running.
    pub fn is_running(&self) -> bool {
        lock(&self.thread).is_some()
    }

    /// Stop the dispatch thread, join it, and discard queued tasks.
    ///
    /// Returns the number of tasks discarded. Later submissions are
    /// rejected.
    pub fn shutdown(&self) -> usize {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _queue = lock(&self.shared.queue);
            self.shared.available.notify_all();
        }
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                tracing::warn!("smoothing thread panicked");
            }
        }
        self.clear_queue()
    }

    /// Start a new tick: reset the per-tick dispatch counter.
    pub fn on_tick(&self) {
        self.shared.dispatched_this_tick.store(0, Ordering::Release);
        self.shared.available.notify_one();
    }

    /// Record tick performance and forward `mspt` to admission control.
    pub fn update_performance(&self, tps: f64, mspt: f64) {
        if tps.is_finite() {
            self.shared.tps_bits.store(tps.to_bits(), Ordering::Release);
        }
        self.shared.mspt_bits.store(mspt.to_bits(), Ordering::Release);
        self.shared.admission.update_mspt(mspt);
    }

    /// Per-tick dispatch budget at the last reported TPS.
    pub fn adaptive_budget(&self) -> usize {
        self.shared.budget()
    }

    /// Tasks waiting.
    pub fn queue_len(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Queue occupancy as a percentage.
    pub fn usage_percent(&self) -> f64 {
        self.queue_len() as f64 * 100.0 / self.shared.config.max_queue_size as f64
    }

    /// Discard every queued task, counting each as dropped.
    pub fn clear_queue(&self) -> usize {
        let drained = std::mem::take(&mut *lock(&self.shared.queue));
        for task in drained.values() {
            self.shared.drop_task(task);
        }
        drained.len()
    }

    /// Current statistics.
    pub fn stats(&self) -> SchedulerStats {
        let s = &self.shared;
        SchedulerStats {
            queued: self.queue_len(),
            capacity: s.config.max_queue_size,
            submitted: s.counters.submitted.load(Ordering::Relaxed),
            executed: s.counters.executed.load(Ordering::Relaxed),
            dropped: s.counters.dropped.load(Ordering::Relaxed),
            evicted: s.counters.evicted.load(Ordering::Relaxed),
            failed: s.counters.failed.load(Ordering::Relaxed),
            dispatched_this_tick: s.dispatched_this_tick.load(Ordering::Acquire),
            budget: s.budget(),
            tps: s.tps(),
            mspt: f64::from_bits(s.mspt_bits.load(Ordering::Acquire)),
        }
    }

    /// Counters per category, sorted by name.
    pub fn category_stats(&self) -> Vec<CategoryStats> {
        let mut out: Vec<CategoryStats> = self
            .shared
            .categories
            .iter()
            .map(|e| CategoryStats {
                category: e.key().clone(),
                submitted: e.submitted.load(Ordering::Relaxed),
                executed: e.executed.load(Ordering::Relaxed),
                dropped: e.dropped.load(Ordering::Relaxed),
                failed: e.failed.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.category.cmp(&b.category));
        out
    }

    /// Zero every counter and forget per-category statistics.
    pub fn reset_stats(&self) {
        let c = &self.shared.counters;
        for counter in [&c.submitted, &c.executed, &c.dropped, &c.evicted, &c.failed] {
            counter.store(0, Ordering::Relaxed);
        }
        self.shared.categories.clear();
    }
}

impl Drop for TaskSmoothingScheduler {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

impl fmt::Debug for TaskSmoothingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSmoothingScheduler")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Body of the `recon-smoothing` thread.
fn dispatch_loop(shared: Arc<Shared>) {
    tracing::debug!("smoothing thread started");
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if shared.dispatch_cycle() > 0 {
            continue;
        }
        let queue = lock(&shared.queue);
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let _ = shared
            .available
            .wait_timeout(queue, shared.config.idle_poll)
            .unwrap_or_else(PoisonError::into_inner);
    }
    tracing::debug!("smoothing thread stopped");
}

// Compile-time assertion: TaskSmoothingScheduler must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<TaskSmoothingScheduler>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use std::time::{Duration, Instant};

    /// Runs every job on the submitting thread.
    struct InlinePool;

    impl WorkerPool for InlinePool {
        fn try_submit(&self, job: Job) -> Result<(), ComputeError> {
            job();
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    /// Accepts `room` jobs and then reports saturation.
    struct NarrowPool {
        room: AtomicUsize,
    }

    impl WorkerPool for NarrowPool {
        fn try_submit(&self, job: Job) -> Result<(), ComputeError> {
            if self
                .room
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
                .is_ok()
            {
                job();
                Ok(())
            } else {
                Err(ComputeError::QueueSaturated)
            }
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    fn admission() -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(AdmissionConfig::default()).unwrap())
    }

    fn scheduler(max_queue: usize, per_tick: usize, pool: Arc<dyn WorkerPool>) -> TaskSmoothingScheduler {
        let config = SchedulerConfig {
            max_queue_size: max_queue,
            max_tasks_per_tick: per_tick,
            idle_poll: Duration::from_millis(1),
        };
        TaskSmoothingScheduler::new(config, admission(), pool).unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Job {
        let log = Arc::clone(log);
        Box::new(move || lock(&log).push(tag))
    }

    // ── Ordering ────────────────────────────────────────────────

    #[test]
    fn dispatches_priority_major_fifo_minor() {
        let s = scheduler(100, 100, Arc::new(InlinePool));
        let log = Arc::new(Mutex::new(Vec::new()));
        s.submit(recorder(&log, 30), Priority::Normal, "t");
        s.submit(recorder(&log, 10), Priority::Critical, "t");
        s.submit(recorder(&log, 31), Priority::Normal, "t");
        s.submit(recorder(&log, 20), Priority::High, "t");
        s.submit(recorder(&log, 11), Priority::Critical, "t");
        assert_eq!(s.dispatch_cycle(), 5);
        assert_eq!(*lock(&log), vec![10, 11, 20, 30, 31]);
    }

    #[test]
    fn budget_limits_dispatch_until_next_tick() {
        let s = scheduler(100, 2, Arc::new(InlinePool));
        s.update_performance(18.5, 40.0);
        for _ in 0..5 {
            assert!(s.submit(Box::new(|| {}), Priority::Critical, "t"));
        }
        assert_eq!(s.dispatch_cycle(), 2);
        assert_eq!(s.dispatch_cycle(), 0);
        s.on_tick();
        assert_eq!(s.dispatch_cycle(), 2);
        assert_eq!(s.queue_len(), 1);
    }

    #[test]
    fn adaptive_budget_follows_tps() {
        let s = scheduler(10, 20, Arc::new(InlinePool));
        for (tps, want) in [(20.0, 30), (19.5, 30), (18.0, 20), (15.0, 14), (10.0, 10)] {
            s.update_performance(tps, 10.0);
            assert_eq!(s.adaptive_budget(), want, "tps {tps}");
        }
        let tiny = scheduler(10, 1, Arc::new(InlinePool));
        tiny.update_performance(5.0, 10.0);
        assert_eq!(tiny.adaptive_budget(), 1);
    }

    // ── Admission and capacity ──────────────────────────────────

    #[test]
    fn full_queue_rejects_normal_and_evicts_for_critical() {
        let s = scheduler(3, 10, Arc::new(InlinePool));
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(s.submit(recorder(&log, 1), Priority::High, "t"));
        assert!(s.submit(recorder(&log, 2), Priority::Low, "t"));
        assert!(s.submit(recorder(&log, 3), Priority::Normal, "t"));
        assert!(!s.submit(recorder(&log, 4), Priority::Normal, "t"));
        assert!(s.submit(recorder(&log, 5), Priority::Critical, "t"));

        let stats = s.stats();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.dropped, 2);

        s.dispatch_cycle();
        assert_eq!(*lock(&log), vec![5, 1, 3]);
    }

    #[test]
    fn critical_load_sheds_low_but_keeps_critical() {
        let s = scheduler(10, 10, Arc::new(InlinePool));
        s.update_performance(10.0, 100.0);
        assert!(!s.submit(Box::new(|| {}), Priority::Low, "t"));
        assert!(s.submit(Box::new(|| {}), Priority::Critical, "t"));
        assert_eq!(s.stats().dropped, 1);
    }

    // ── Failures ────────────────────────────────────────────────

    #[test]
    fn panicking_task_is_counted_and_dispatch_continues() {
        let s = scheduler(10, 10, Arc::new(InlinePool));
        let log = Arc::new(Mutex::new(Vec::new()));
        s.submit(Box::new(|| panic!("task blew up")), Priority::High, "boom");
        s.submit(recorder(&log, 7), Priority::Normal, "ok");
        assert_eq!(s.dispatch_cycle(), 2);
        let stats = s.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.executed, 1);
        assert_eq!(*lock(&log), vec![7]);

        let cats = s.category_stats();
        assert_eq!(cats[0].category, "boom");
        assert_eq!(cats[0].failed, 1);
        assert_eq!(cats[1].executed, 1);
    }

    #[test]
    fn saturated_pool_requeues_in_order() {
        let pool = Arc::new(NarrowPool {
            room: AtomicUsize::new(1),
        });
        let s = scheduler(10, 10, pool.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            s.submit(recorder(&log, tag), Priority::Normal, "t");
        }
        assert_eq!(s.dispatch_cycle(), 1);
        assert_eq!(s.queue_len(), 3);
        assert_eq!(s.stats().dropped, 0);

        pool.room.store(10, Ordering::SeqCst);
        s.dispatch_cycle();
        assert_eq!(*lock(&log), vec![0, 1, 2, 3]);
    }

    // ── Lifecycle ───────────────────────────────────────────────

    #[test]
    fn dispatch_thread_drains_queue() {
        let s = scheduler(100, 50, Arc::new(InlinePool));
        s.start().unwrap();
        assert!(s.is_running());
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..10 {
            s.submit(recorder(&log, tag), Priority::Normal, "t");
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while lock(&log).len() < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(lock(&log).len(), 10);
        s.shutdown();
        assert!(!s.is_running());
        assert!(!s.submit(Box::new(|| {}), Priority::Critical, "t"));
    }

    #[test]
    fn clear_and_reset() {
        let s = scheduler(10, 10, Arc::new(InlinePool));
        s.submit(Box::new(|| {}), Priority::Normal, "a");
        s.submit(Box::new(|| {}), Priority::Normal, "b");
        assert_eq!(s.clear_queue(), 2);
        assert_eq!(s.stats().dropped, 2);
        s.reset_stats();
        assert_eq!(s.stats().submitted, 0);
        assert!(s.category_stats().is_empty());
    }

    #[test]
    fn stats_line_format() {
        let s = scheduler(1000, 20, Arc::new(InlinePool));
        s.update_performance(20.0, 12.34);
        let line = s.stats().to_string();
        assert_eq!(
            line,
            "TaskSmoothing: Queue=0/1000 | Submitted=0 | Executed=0 | Dropped=0 | Rate=0/30/tick | TPS=20.0 | MSPT=12.3"
        );
    }
}
