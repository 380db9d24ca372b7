//! Core types and traits for the recon compute-and-reconcile engine.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the vocabulary shared by every other recon crate: identifiers,
//! fingerprints, the error taxonomy, the strategy traits a subsystem
//! implements to plug into the pipeline, and the collaborator traits
//! (worker pool, metrics source, owning-thread executor) the engine
//! consumes.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod traits;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ApplyOutcome, ComputeError, NoOpReason, Resolution, ResultSource, SubmitError};
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use id::{CellPos, PartitionId, Priority, VersionToken};
pub use traits::{
    Captured, Job, MetricsSource, OwnerExecutor, OwnerJob, ResultApplier, SnapshotSource,
    Subsystem, TickSample, WorkerComputation, WorkerPool,
};
