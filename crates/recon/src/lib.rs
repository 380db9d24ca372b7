//! Recon: an asynchronous compute-and-reconcile engine for tick-driven
//! simulations.
//!
//! Expensive, pure computations are captured on the thread that owns the
//! simulation state, run on a worker pool, and applied back on the owner
//! only if the state they were computed from is still current. Results
//! are memoised in a three-tier cache and identical in-flight requests
//! share one computation.
//!
//! This is the top-level facade crate that re-exports the public API from
//! all recon sub-crates.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use recon::prelude::*;
//!
//! struct Doubler;
//! impl Subsystem for Doubler {
//!     type Identity = CellPos;
//!     type State = Vec<(CellPos, u32)>;
//!     type Snapshot = u32;
//!     type Output = u32;
//! }
//!
//! struct Source;
//! impl SnapshotSource<Doubler> for Source {
//!     fn fingerprint(&self, pos: &CellPos) -> Fingerprint {
//!         Fingerprint::spatial(*pos)
//!     }
//!     fn capture(&self, state: &Vec<(CellPos, u32)>, pos: &CellPos) -> Option<Captured<u32>> {
//!         let (_, v) = state.iter().find(|(p, _)| p == pos)?;
//!         Some(Captured::new(*v, VersionToken(*v as u64)))
//!     }
//! }
//!
//! struct Double;
//! impl WorkerComputation<Doubler> for Double {
//!     fn compute(&self, v: &u32) -> Result<u32, ComputeError> {
//!         Ok(v * 2)
//!     }
//! }
//!
//! struct Store;
//! impl ResultApplier<Doubler> for Store {
//!     fn current_version(&self, state: &Vec<(CellPos, u32)>, pos: &CellPos) -> Option<VersionToken> {
//!         state.iter().find(|(p, _)| p == pos).map(|(_, v)| VersionToken(*v as u64))
//!     }
//!     fn apply_unchecked(&self, _: &mut Vec<(CellPos, u32)>, _: &CellPos, _: &u32) {}
//! }
//!
//! let pool = Arc::new(ThreadPool::new(PoolConfig::default()).unwrap());
//! let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()).unwrap());
//! let pipeline = AsyncPipeline::new(
//!     PipelineConfig::named("doubler"),
//!     Strategies::new(Source, Double, Store),
//!     pool,
//!     admission,
//! )
//! .unwrap();
//!
//! let origin = CellPos::new(0, 0, 0);
//! let mut state = vec![(origin, 21)];
//! let r = pipeline.resolve_now(&mut state, origin, Priority::Critical);
//! assert_eq!(r.value(), Some(&42));
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `recon-core` | IDs, fingerprints, errors, strategy and collaborator traits |
//! | [`cache`] | `recon-cache` | Three-tier result cache |
//! | [`engine`] | `recon-engine` | Pipeline, worker pool, admission, smoothing, owner threads |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types, traits, and IDs (`recon-core`).
///
/// Contains [`types::Fingerprint`], the [`types::Resolution`] taxonomy,
/// and the traits a subsystem implements ([`types::SnapshotSource`],
/// [`types::WorkerComputation`], [`types::ResultApplier`]).
pub use recon_core as types;

/// Hot/warm/cold result cache (`recon-cache`).
pub use recon_cache as cache;

/// Pipeline and scheduling machinery (`recon-engine`).
///
/// [`engine::AsyncPipeline`] coordinates capture, compute and apply;
/// [`engine::TaskSmoothingScheduler`] and [`engine::AdmissionController`]
/// keep background work within the tick budget.
pub use recon_engine as engine;

/// Common imports for typical recon usage.
///
/// ```rust
/// use recon::prelude::*;
/// ```
pub mod prelude {
    // Core types and traits
    pub use recon_core::{
        Captured, CellPos, Fingerprint, PartitionId, Priority, ResultApplier, SnapshotSource,
        Subsystem, VersionToken, WorkerComputation, WorkerPool,
    };

    // Outcomes and errors
    pub use recon_core::{ComputeError, NoOpReason, Resolution, ResultSource, SubmitError};

    // Cache
    pub use recon_cache::{CacheConfig, TieredCache};

    // Engine
    pub use recon_engine::{
        AdmissionConfig, AdmissionController, AsyncPipeline, OverloadPolicy, OwnerConfig,
        OwnerThread, PartitionedExecutor, PipelineConfig, PoolConfig, Request, SchedulerConfig,
        Strategies, TaskSmoothingScheduler, ThreadPool,
    };
}
