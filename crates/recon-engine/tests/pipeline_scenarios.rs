//! Integration test: end-to-end pipeline behaviour over the grid fixture.
//!
//! Runs [`AsyncPipeline`] against a real [`ThreadPool`] and checks the
//! externally visible contract: worker results are applied and cached,
//! slow workers fall back within the call, concurrent requests share
//! one computation, stale results never land, and every in-flight entry
//! is retired.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use recon_cache::Tier;
use recon_core::{
    CellPos, ComputeError, Fingerprint, NoOpReason, Priority, Resolution, ResultSource,
    WorkerComputation, WorkerPool,
};
use recon_engine::{
    AdmissionConfig, AdmissionController, AsyncPipeline, OverloadPolicy, PipelineConfig,
    PoolConfig, Request, SchedulerConfig, Strategies, TaskSmoothingScheduler, ThreadPool,
};
use recon_test_utils::{
    FailingComputation, Gate, GatedComputation, GridApplier, GridSource, GridWorld, NetworkScan,
    PanickingComputation, SlowComputation, SumComputation,
};

// ── Helpers ──────────────────────────────────────────────────────────

fn pool(workers: usize) -> Arc<ThreadPool> {
    Arc::new(
        ThreadPool::new(PoolConfig {
            worker_count: Some(workers),
            ..PoolConfig::default()
        })
        .unwrap(),
    )
}

fn admission() -> Arc<AdmissionController> {
    Arc::new(AdmissionController::new(AdmissionConfig::default()).unwrap())
}

fn build(
    config: PipelineConfig,
    computation: impl WorkerComputation<NetworkScan> + 'static,
    pool: Arc<dyn WorkerPool>,
) -> AsyncPipeline<NetworkScan> {
    let strategies = Strategies::new(GridSource::default(), computation, GridApplier);
    AsyncPipeline::new(config, strategies, pool, admission()).unwrap()
}

fn config(critical_ms: u64) -> PipelineConfig {
    PipelineConfig {
        critical_timeout: Duration::from_millis(critical_ms),
        ..PipelineConfig::named("scan")
    }
}

const ORIGIN: CellPos = CellPos::new(0, 0, 0);

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn fast_worker_applies_and_caches_in_hot_tier() {
    let compute = SlowComputation::new(Duration::from_millis(2));
    let calls = compute.calls.clone();
    let p = build(config(50), compute, pool(2));
    let mut world = GridWorld::cube(2, 1);

    let r = p.resolve_now(&mut world, ORIGIN, Priority::High);
    assert_eq!(
        r,
        Resolution::Ready {
            value: 7,
            source: ResultSource::Worker
        }
    );
    assert_eq!(world.applied(ORIGIN), Some(7));
    assert_eq!(p.cache().tier_of(&Fingerprint::spatial(ORIGIN)), Some(Tier::Hot));

    let again = p.resolve_now(&mut world, ORIGIN, Priority::High);
    assert_eq!(again.source(), Some(ResultSource::Cache));
    assert_eq!(again.value(), Some(&7));
    assert_eq!(calls.get(), 1, "cache hit must not dispatch");
    assert_eq!(p.pending_len(), 0);
}

#[test]
fn slow_worker_falls_back_within_the_call() {
    let compute = SlowComputation::new(Duration::from_millis(40));
    let p = build(config(5), compute, pool(2));
    let mut world = GridWorld::cube(1, 2);

    let start = Instant::now();
    let r = p.resolve_now(&mut world, ORIGIN, Priority::Critical);
    let elapsed = start.elapsed();

    assert_eq!(
        r,
        Resolution::Ready {
            value: 14,
            source: ResultSource::Fallback
        }
    );
    assert_eq!(world.applied(ORIGIN), Some(14));
    assert!(elapsed >= Duration::from_millis(5));
    assert_eq!(p.stats().timeouts, 1);
    assert_eq!(p.pending_len(), 0);
}

#[test]
fn concurrent_requests_share_one_computation() {
    const CALLERS: usize = 16;
    let mut gate = Gate::new();
    let compute = GatedComputation::new(&gate);
    let calls = compute.calls.clone();
    let p = build(config(50), compute, pool(4));
    let mut world = GridWorld::cube(1, 3);

    let handles: Vec<_> = thread::scope(|s| {
        let joins: Vec<_> = (0..CALLERS)
            .map(|_| s.spawn(|| p.request(&world, ORIGIN, Priority::Normal, OverloadPolicy::Drop)))
            .collect();
        joins
            .into_iter()
            .map(|j| match j.join().unwrap() {
                Request::Pending(h) => h,
                Request::Ready(r) => panic!("expected pending, got {r:?}"),
            })
            .collect()
    });
    assert!(handles.windows(2).all(|w| w[0].same_computation(&w[1])));
    assert_eq!(p.stats().attached, CALLERS as u64 - 1);

    gate.open();
    p.drain_until_idle(&mut world, Instant::now() + Duration::from_secs(5));

    let expected = Resolution::Ready {
        value: 21,
        source: ResultSource::Worker,
    };
    for h in &handles {
        assert_eq!(h.try_get(), Some(expected.clone()));
    }
    assert_eq!(calls.get(), 1);
    assert_eq!(p.pending_len(), 0);
}

#[test]
fn stale_result_is_never_applied() {
    let mut gate = Gate::new();
    let compute = GatedComputation::new(&gate);
    let p = build(config(50), compute, pool(2));
    let mut world = GridWorld::cube(1, 1);

    let handle = p
        .request(&world, ORIGIN, Priority::Normal, OverloadPolicy::Drop)
        .handle()
        .cloned()
        .unwrap();
    // A neighbour changes while the worker is computing.
    world.set(CellPos::new(1, 0, 0), 10);
    gate.open();

    let report = p.drain_until_idle(&mut world, Instant::now() + Duration::from_secs(5));
    assert_eq!(report.stale, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(report.applied, 1);
    // Only the recomputed value (6 + 10) was ever applied.
    assert_eq!(world.applied(ORIGIN), Some(16));
    assert_eq!(world.apply_count(), 1);
    assert_eq!(handle.try_get().and_then(Resolution::into_value), Some(16));
}

#[test]
fn worker_failure_falls_back() {
    let compute = FailingComputation::new(1);
    let p = build(config(100), compute, pool(2));
    let mut world = GridWorld::cube(1, 1);

    let r = p.resolve_now(&mut world, ORIGIN, Priority::High);
    assert_eq!(
        r,
        Resolution::Ready {
            value: 7,
            source: ResultSource::Fallback
        }
    );
    let stats = p.stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(p.failure_log_counts(), vec![("scan:compute".to_owned(), 1)]);
}

#[test]
fn panicking_worker_resolves_as_failed_no_op() {
    let compute = PanickingComputation::default();
    let workers = pool(1);
    let p = build(config(100), compute, workers.clone());
    let mut world = GridWorld::cube(1, 1);

    match p.resolve_now(&mut world, ORIGIN, Priority::High) {
        Resolution::NoOp(NoOpReason::Failed(ComputeError::WorkerFailure { reason })) => {
            assert!(reason.contains("exploded"), "reason: {reason}");
        }
        other => panic!("expected failed no-op, got {other:?}"),
    }
    assert_eq!(world.apply_count(), 0);
    assert!(workers.is_healthy());
    assert_eq!(p.pending_len(), 0);
}

#[test]
fn vanished_identity_is_a_silent_no_op() {
    let p = build(config(50), SumComputation::default(), pool(2));
    let mut world = GridWorld::cube(1, 1);
    world.remove(ORIGIN);
    assert_eq!(
        p.resolve_now(&mut world, ORIGIN, Priority::High),
        Resolution::NoOp(NoOpReason::IdentityGone)
    );
    match p.request(&world, ORIGIN, Priority::Normal, OverloadPolicy::RunInline) {
        Request::Ready(Resolution::NoOp(NoOpReason::IdentityGone)) => {}
        other => panic!("expected IdentityGone, got {other:?}"),
    }
}

// ── Negative cache ───────────────────────────────────────────────────

fn negative_config(retry_probability: f64) -> PipelineConfig {
    PipelineConfig {
        negative_ttl: Some(Duration::from_secs(60)),
        retry_probability,
        ..config(100)
    }
}

#[test]
fn negative_cache_short_circuits_with_zero_retry() {
    let compute = FailingComputation::always();
    let calls = compute.calls.clone();
    let p = build(negative_config(0.0), compute, pool(1));
    let mut world = GridWorld::cube(1, 1);

    assert!(!p.resolve_now(&mut world, ORIGIN, Priority::High).is_ready());
    let after_first = calls.get();
    for _ in 0..5 {
        assert_eq!(
            p.resolve_now(&mut world, ORIGIN, Priority::High),
            Resolution::NoOp(NoOpReason::NegativeCached)
        );
    }
    assert_eq!(calls.get(), after_first);
    assert_eq!(p.stats().negative_hits, 5);

    p.invalidate(&Fingerprint::spatial(ORIGIN));
    assert!(!p.resolve_now(&mut world, ORIGIN, Priority::High).is_ready());
    assert!(calls.get() > after_first);
}

#[test]
fn negative_cache_always_retries_with_full_probability() {
    let compute = FailingComputation::always();
    let calls = compute.calls.clone();
    let p = build(negative_config(1.0), compute, pool(1));
    let mut world = GridWorld::cube(1, 1);

    let mut seen = calls.get();
    for _ in 0..3 {
        let r = p.resolve_now(&mut world, ORIGIN, Priority::High);
        assert!(matches!(r, Resolution::NoOp(NoOpReason::Failed(_))), "{r:?}");
        assert!(calls.get() > seen);
        seen = calls.get();
    }
    assert_eq!(p.stats().negative_hits, 0);
}

// ── Overload ─────────────────────────────────────────────────────────

#[test]
fn unhealthy_pool_computes_critical_work_inline() {
    let workers = pool(2);
    workers.shutdown();
    let compute = SumComputation::default();
    let p = build(config(50), compute, workers);
    let mut world = GridWorld::cube(1, 1);

    assert!(!p.is_healthy());
    assert_eq!(
        p.resolve_now(&mut world, ORIGIN, Priority::Critical),
        Resolution::Ready {
            value: 7,
            source: ResultSource::Inline
        }
    );
    assert_eq!(world.applied(ORIGIN), Some(7));
    assert!(p.consecutive_unhealthy() >= 2);
}

#[test]
fn shed_background_work_is_dropped_under_critical_load() {
    let p = build(config(50), SumComputation::default(), pool(2));
    let world = GridWorld::cube(1, 1);
    p.admission().update_mspt(80.0);

    match p.request(&world, ORIGIN, Priority::Low, OverloadPolicy::Drop) {
        Request::Ready(Resolution::NoOp(NoOpReason::Dropped)) => {}
        other => panic!("expected Dropped, got {other:?}"),
    }
    assert_eq!(p.stats().dropped, 1);
    assert_eq!(p.pending_len(), 0);
}

// ── Scheduler routing ────────────────────────────────────────────────

#[test]
fn background_work_flows_through_the_smoothing_scheduler() {
    let workers = pool(2);
    let scheduler = Arc::new(
        TaskSmoothingScheduler::new(SchedulerConfig::default(), admission(), workers.clone())
            .unwrap(),
    );
    scheduler.start().unwrap();
    let p = build(config(50), SumComputation::default(), workers)
        .with_scheduler(Arc::clone(&scheduler));
    let mut world = GridWorld::cube(3, 1);

    let positions: Vec<CellPos> = (-2..=2).map(|x| CellPos::new(x, 0, 0)).collect();
    let handles: Vec<_> = positions
        .iter()
        .filter_map(|pos| {
            p.request(&world, *pos, Priority::Normal, OverloadPolicy::Drop)
                .handle()
                .cloned()
        })
        .collect();
    assert_eq!(handles.len(), positions.len());

    p.drain_until_idle(&mut world, Instant::now() + Duration::from_secs(5));
    for (pos, h) in positions.iter().zip(&handles) {
        assert_eq!(h.try_get().and_then(Resolution::into_value), Some(7), "at {pos}");
    }
    let cats = scheduler.category_stats();
    assert_eq!(cats.len(), 1);
    assert_eq!(cats[0].category, "scan");
    assert_eq!(cats[0].submitted, positions.len() as u64);
    assert_eq!(cats[0].dropped, 0);
    scheduler.shutdown();
}

fn unstarted_scheduler(max_queue_size: usize, pool: Arc<ThreadPool>) -> Arc<TaskSmoothingScheduler> {
    let config = SchedulerConfig {
        max_queue_size,
        ..SchedulerConfig::default()
    };
    Arc::new(TaskSmoothingScheduler::new(config, admission(), pool).unwrap())
}

#[test]
fn evicted_background_request_resolves_as_dropped() {
    let workers = pool(2);
    let scheduler = unstarted_scheduler(1, workers.clone());
    let p = build(config(50), SumComputation::default(), workers)
        .with_scheduler(Arc::clone(&scheduler));
    let mut world = GridWorld::cube(1, 1);

    let handle = p
        .request(&world, ORIGIN, Priority::Normal, OverloadPolicy::RunInline)
        .handle()
        .cloned()
        .unwrap();
    assert_eq!(p.pending_len(), 1);
    assert!(scheduler.submit(Box::new(|| {}), Priority::Critical, "other"));
    assert_eq!(scheduler.stats().evicted, 1);

    let report = p.drain_completions(&mut world);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.fallbacks, 0);
    assert_eq!(handle.try_get(), Some(Resolution::NoOp(NoOpReason::Dropped)));
    assert_eq!(p.pending_len(), 0);
    assert_eq!(world.apply_count(), 0);
    scheduler.shutdown();
}

#[test]
fn pool_refusal_during_dispatch_resolves_as_dropped() {
    let closed = pool(1);
    closed.shutdown();
    let scheduler = unstarted_scheduler(16, closed);
    let p = build(config(50), SumComputation::default(), pool(2))
        .with_scheduler(Arc::clone(&scheduler));
    let mut world = GridWorld::cube(2, 1);

    let handles: Vec<_> = (-1..=1)
        .filter_map(|x| {
            p.request(&world, CellPos::new(x, 0, 0), Priority::Normal, OverloadPolicy::Drop)
                .handle()
                .cloned()
        })
        .collect();
    assert_eq!(handles.len(), 3);
    assert_eq!(scheduler.dispatch_cycle(), 0);
    assert_eq!(scheduler.queue_len(), 0);

    let report = p.drain_completions(&mut world);
    assert_eq!(report.dropped, 3);
    assert_eq!(p.pending_len(), 0);
    for h in &handles {
        assert_eq!(h.try_get(), Some(Resolution::NoOp(NoOpReason::Dropped)));
    }
    assert_eq!(p.stats().dropped, 3);
}

// ── Registry hygiene ─────────────────────────────────────────────────

#[test]
fn no_in_flight_entry_is_orphaned() {
    let compute = FailingComputation::new(3);
    let p = build(config(20), compute, pool(3));
    let mut world = GridWorld::cube(3, 1);

    for round in 0..5 {
        for x in -3..=3 {
            let pos = CellPos::new(x, round % 3 - 1, 0);
            let _ = p.request(&world, pos, Priority::Normal, OverloadPolicy::RunInline);
        }
        world.set(CellPos::new(round - 2, 0, 0), 4);
        p.drain_until_idle(&mut world, Instant::now() + Duration::from_secs(5));
        assert_eq!(p.pending_len(), 0, "round {round}");
    }
    let stats = p.stats();
    assert_eq!(stats.pending, 0);
    assert!(stats.applied > 0);
}

#[test]
fn region_invalidation_forgets_nearby_results() {
    let p = build(config(50), SumComputation::default(), pool(2));
    let mut world = GridWorld::cube(4, 1);
    for x in -4..=4 {
        p.resolve_now(&mut world, CellPos::new(x, 0, 0), Priority::High);
    }
    assert_eq!(p.cache().len(), 9);
    let removed = p.invalidate_region(ORIGIN, 2);
    assert_eq!(removed, 5);
    assert!(!p.cache().contains(&Fingerprint::spatial(ORIGIN)));
    assert!(p.cache().contains(&Fingerprint::spatial(CellPos::new(3, 0, 0))));
}
