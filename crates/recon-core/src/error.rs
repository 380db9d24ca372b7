//! Error and outcome types for the compute-and-reconcile engine.
//!
//! Organised by where the value is produced: worker computations
//! ([`ComputeError`]), the owning-thread applier ([`ApplyOutcome`]),
//! the pipeline's answer to a caller ([`Resolution`]), and executor
//! submission ([`SubmitError`]).

use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::id::PartitionId;

/// Failures that can occur while producing a result.
///
/// The pipeline handles every variant internally. Callers only ever
/// see one wrapped inside [`NoOpReason::Failed`] when even the
/// synchronous fallback could not produce a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComputeError {
    /// The snapshot was invalidated by a concurrent mutation before apply.
    Stale,
    /// The worker did not finish within its budget.
    Timeout {
        /// The budget that was exceeded.
        budget: Duration,
    },
    /// The computation returned an error or panicked.
    WorkerFailure {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// A bounded queue (worker pool or scheduler) was full.
    QueueSaturated,
    /// Snapshot capture found nothing to snapshot.
    IdentityGone,
    /// The worker pool has shut down.
    PoolUnavailable,
}

impl ComputeError {
    /// Shorthand for a [`WorkerFailure`](Self::WorkerFailure).
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::WorkerFailure {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale => write!(f, "snapshot is stale"),
            Self::Timeout { budget } => write!(f, "computation exceeded {budget:?}"),
            Self::WorkerFailure { reason } => write!(f, "worker failed: {reason}"),
            Self::QueueSaturated => write!(f, "queue saturated"),
            Self::IdentityGone => write!(f, "identity no longer exists"),
            Self::PoolUnavailable => write!(f, "worker pool unavailable"),
        }
    }
}

impl Error for ComputeError {}

/// Result of reconciling a computed value against live state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Version tokens matched and the mutation was performed.
    Applied,
    /// Live state moved on since the snapshot; nothing was mutated.
    Stale,
}

/// Where a resolved value came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultSource {
    /// Served from the tiered cache without computing.
    Cache,
    /// Computed on a worker thread and applied on the owning thread.
    Worker,
    /// Computed synchronously on the owning thread after a timeout,
    /// failure, or stale apply.
    Fallback,
    /// Computed synchronously because admission control or pool health
    /// rejected the worker path.
    Inline,
}

impl fmt::Display for ResultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cache => "cache",
            Self::Worker => "worker",
            Self::Fallback => "fallback",
            Self::Inline => "inline",
        };
        f.write_str(s)
    }
}

/// Why a request resolved without a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NoOpReason {
    /// Snapshot capture returned nothing; there was nothing to do.
    IdentityGone,
    /// Best-effort work was shed under load.
    Dropped,
    /// The key failed recently and was not retried.
    NegativeCached,
    /// Every path, including the synchronous fallback, failed.
    Failed(ComputeError),
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentityGone => write!(f, "identity gone"),
            Self::Dropped => write!(f, "dropped under load"),
            Self::NegativeCached => write!(f, "negative-cached"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// The answer the pipeline gives for every request: a value or an
/// explicit no-op. Never an unhandled failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution<R> {
    /// A value is available.
    Ready {
        /// The resolved value.
        value: R,
        /// Which path produced it.
        source: ResultSource,
    },
    /// Nothing to apply.
    NoOp(NoOpReason),
}

impl<R> Resolution<R> {
    /// Whether this resolution carries a value.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Borrow the value, if any.
    pub fn value(&self) -> Option<&R> {
        match self {
            Self::Ready { value, .. } => Some(value),
            Self::NoOp(_) => None,
        }
    }

    /// Take the value, if any.
    pub fn into_value(self) -> Option<R> {
        match self {
            Self::Ready { value, .. } => Some(value),
            Self::NoOp(_) => None,
        }
    }

    /// The producing path, if a value is present.
    pub fn source(&self) -> Option<ResultSource> {
        match self {
            Self::Ready { source, .. } => Some(*source),
            Self::NoOp(_) => None,
        }
    }

    /// The no-op reason, if no value is present.
    pub fn no_op_reason(&self) -> Option<&NoOpReason> {
        match self {
            Self::Ready { .. } => None,
            Self::NoOp(r) => Some(r),
        }
    }
}

/// Errors from handing a job to an owning-thread executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// The target owning thread has shut down.
    Shutdown,
    /// The target mailbox is full.
    ChannelFull,
    /// No owning thread is registered for the partition.
    UnknownPartition {
        /// The partition that was addressed.
        partition: PartitionId,
    },
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "owning thread has shut down"),
            Self::ChannelFull => write!(f, "owner mailbox full"),
            Self::UnknownPartition { partition } => write!(f, "unknown partition {partition}"),
        }
    }
}

impl Error for SubmitError {}
