//! Integration test: pipelines driven from owning threads.
//!
//! Each partition's [`GridWorld`] lives on its own [`OwnerThread`].
//! Requests arrive through the mailbox, the tick hook drains finished
//! computations, and tick timing feeds admission control.

use std::sync::Arc;
use std::time::{Duration, Instant};

use recon_core::{CellPos, OwnerExecutor, PartitionId, Priority, Resolution, ResultSource};
use recon_engine::{
    AdmissionConfig, AdmissionController, AsyncPipeline, LoadLevel, OverloadPolicy, OwnerConfig,
    OwnerThread, PartitionRegistry, PartitionedExecutor, PipelineConfig, PoolConfig, Strategies,
    ThreadPool, TickHook,
};
use recon_test_utils::{GridApplier, GridSource, GridWorld, NetworkScan, SumComputation};

fn owner_config(name: &str) -> OwnerConfig {
    OwnerConfig {
        name: name.into(),
        tick_rate_hz: 100.0,
        mailbox_capacity: 256,
    }
}

fn pipeline(pool: Arc<ThreadPool>, name: &str) -> AsyncPipeline<NetworkScan> {
    let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()).unwrap());
    AsyncPipeline::new(
        PipelineConfig::named(name),
        Strategies::new(GridSource::default(), SumComputation::default(), GridApplier),
        pool,
        admission,
    )
    .unwrap()
}

fn pool() -> Arc<ThreadPool> {
    Arc::new(
        ThreadPool::new(PoolConfig {
            worker_count: Some(2),
            ..PoolConfig::default()
        })
        .unwrap(),
    )
}

#[test]
fn tick_hook_drains_background_requests() {
    let pipe = Arc::new(pipeline(pool(), "owner-scan"));
    let hook: TickHook<GridWorld> = {
        let pipe = Arc::clone(&pipe);
        Box::new(move |world, _| {
            pipe.drain_completions(world);
        })
    };
    let owner = OwnerThread::spawn(GridWorld::cube(2, 1), owner_config("scan-owner"), Some(hook))
        .unwrap();

    let targets: Vec<CellPos> = (-1..=1).map(|x| CellPos::new(x, 0, 0)).collect();
    let requests = {
        let pipe = Arc::clone(&pipe);
        let targets = targets.clone();
        owner
            .call(move |world| {
                targets
                    .iter()
                    .map(|pos| pipe.request(world, *pos, Priority::Normal, OverloadPolicy::Drop))
                    .collect::<Vec<_>>()
            })
            .unwrap()
    };
    for r in requests {
        let resolution = r.wait(Duration::from_secs(5)).expect("resolved by tick hook");
        assert_eq!(resolution.value(), Some(&7));
        assert_eq!(resolution.source(), Some(ResultSource::Worker));
    }

    let world = owner.shutdown().unwrap();
    for pos in targets {
        assert_eq!(world.applied(pos), Some(7));
    }
    assert_eq!(pipe.pending_len(), 0);
}

#[test]
fn critical_requests_resolve_on_the_owner() {
    let pipe = Arc::new(pipeline(pool(), "owner-critical"));
    let owner =
        OwnerThread::spawn(GridWorld::cube(1, 2), owner_config("critical-owner"), None).unwrap();

    let r = {
        let pipe = Arc::clone(&pipe);
        owner
            .call(move |world| pipe.resolve_now(world, CellPos::new(0, 0, 0), Priority::Critical))
            .unwrap()
    };
    assert_eq!(
        r,
        Resolution::Ready {
            value: 14,
            source: ResultSource::Worker
        }
    );
}

#[test]
fn owner_tick_metrics_feed_admission() {
    let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()).unwrap());
    let hook: TickHook<()> = Box::new(|_, _| std::thread::sleep(Duration::from_millis(50)));
    let owner = OwnerThread::spawn((), owner_config("slow-owner"), Some(hook)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while owner.metrics().tick_count() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    admission.observe(owner.metrics().as_ref());
    assert_eq!(admission.load_level(), LoadLevel::Critical);
    assert!(admission.should_skip_low_priority());
    owner.shutdown();
}

#[test]
fn partitions_keep_per_partition_fifo_under_concurrent_producers() {
    let exec: Arc<PartitionedExecutor<Vec<(usize, usize)>>> =
        Arc::new(PartitionedExecutor::new(owner_config("region")).unwrap());
    // 50 jobs per partition; the mailbox never fills.
    for p in 0..4 {
        exec.add_partition(PartitionId(p), Vec::new(), None).unwrap();
    }

    std::thread::scope(|s| {
        for producer in 0..4usize {
            let exec = Arc::clone(&exec);
            s.spawn(move || {
                for seq in 0..50usize {
                    let partition = PartitionId((seq % 4) as u32);
                    exec.run_on_owner(
                        partition,
                        Box::new(move |v: &mut Vec<(usize, usize)>| v.push((producer, seq))),
                    )
                    .unwrap();
                }
            });
        }
    });

    for (id, log) in exec.shutdown() {
        assert_eq!(log.len(), 50, "partition {id}");
        for producer in 0..4 {
            let seqs: Vec<usize> = log
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, s)| *s)
                .collect();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]), "partition {id} reordered");
        }
    }
}

#[test]
fn registry_holds_one_pipeline_per_partition() {
    let workers = pool();
    let registry: PartitionRegistry<AsyncPipeline<NetworkScan>> = PartitionRegistry::new();
    let a = registry.get_or_create(PartitionId(1), || pipeline(Arc::clone(&workers), "p1"));
    let b = registry.get_or_create(PartitionId(1), || pipeline(Arc::clone(&workers), "other"));
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(b.name(), "p1");

    let mut world = GridWorld::cube(1, 1);
    a.resolve_now(&mut world, CellPos::new(0, 0, 0), Priority::High);
    assert_eq!(registry.get(PartitionId(1)).unwrap().cache().len(), 1);

    registry.remove(PartitionId(1));
    assert!(registry.is_empty());
}
