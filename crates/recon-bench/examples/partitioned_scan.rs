//! Partitioned world example.
//!
//! Demonstrates: four regions, each owned by its own thread → one
//! pipeline per region sharing a worker pool and a smoothing scheduler →
//! requests posted to owners → tick hooks drain completions and feed
//! admission control → cell edits invalidate cached results.
//!
//! Run with `RUST_LOG=recon_engine=debug` to see load-level changes.

use std::sync::Arc;
use std::time::Duration;

use recon_bench::{reference_pool, scan_positions};
use recon_core::{CellPos, PartitionId, Priority};
use recon_engine::{
    AdmissionConfig, AdmissionController, AsyncPipeline, OverloadPolicy, OwnerConfig,
    PartitionRegistry, PartitionedExecutor, PipelineConfig, SchedulerConfig, Strategies,
    TaskSmoothingScheduler, TickHook,
};
use recon_test_utils::{GridApplier, GridSource, GridWorld, NetworkScan, SumComputation};
use tracing_subscriber::EnvFilter;

const REGIONS: u32 = 4;
const ROUNDS: usize = 20;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== recon partitioned scan example ===\n");

    let pool = reference_pool(4).unwrap();
    let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()).unwrap());
    let scheduler = Arc::new(
        TaskSmoothingScheduler::new(
            SchedulerConfig::default(),
            Arc::clone(&admission),
            pool.clone(),
        )
        .unwrap(),
    );
    scheduler.start().unwrap();

    let pipelines: PartitionRegistry<AsyncPipeline<NetworkScan>> = PartitionRegistry::new();
    let executor = PartitionedExecutor::new(OwnerConfig {
        name: "region".into(),
        tick_rate_hz: 20.0,
        mailbox_capacity: 1024,
    })
    .unwrap();

    for region in 0..REGIONS {
        let id = PartitionId(region);
        let pipeline = pipelines.get_or_create(id, || {
            AsyncPipeline::new(
                PipelineConfig::named(format!("scan-{region}")),
                Strategies::new(GridSource::default(), SumComputation::default(), GridApplier),
                pool.clone(),
                Arc::clone(&admission),
            )
            .unwrap()
            .with_scheduler(Arc::clone(&scheduler))
        });
        let hook: TickHook<GridWorld> = {
            let scheduler = Arc::clone(&scheduler);
            Box::new(move |world, _tick| {
                pipeline.drain_completions(world);
                scheduler.on_tick();
            })
        };
        executor
            .add_partition(id, GridWorld::cube(6, region + 1), Some(hook))
            .unwrap();
    }

    for round in 0..ROUNDS {
        for region in 0..REGIONS {
            let id = PartitionId(region);
            let Some(pipeline) = pipelines.get(id) else {
                continue;
            };
            let positions = scan_positions(32, 5, ((round as u64) << 8) | u64::from(region));
            executor
                .call(id, move |world| {
                    for pos in positions {
                        pipeline.request(world, pos, Priority::Normal, OverloadPolicy::Drop);
                    }
                    // Edit the centre every fifth round.
                    if round % 5 == 4 {
                        let origin = CellPos::new(0, 0, 0);
                        let bumped = world.get(origin).map_or(1, |c| c.value + 1);
                        world.set(origin, bumped);
                        pipeline.invalidate_region(origin, 1);
                    }
                })
                .unwrap();
        }

        if let Some(metrics) = executor.metrics(PartitionId(0)) {
            admission.observe(metrics.as_ref());
            scheduler.update_performance(metrics.tps(), metrics.mspt());
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // Give queued work a few ticks to land.
    std::thread::sleep(Duration::from_millis(500));

    println!("{}", scheduler.stats());
    for region in 0..REGIONS {
        if let Some(p) = pipelines.get(PartitionId(region)) {
            println!("{}", p.stats());
        }
    }

    scheduler.shutdown();
    for (id, world) in executor.shutdown() {
        println!(
            "region {id}: {} results applied across {} cells",
            world.apply_count(),
            world.len()
        );
    }
    pool.shutdown();
}
