//! Strategy traits a subsystem implements and collaborator traits the
//! engine consumes.
//!
//! A subsystem names its types once through [`Subsystem`], then
//! supplies three strategies: [`SnapshotSource`] (owning thread),
//! [`WorkerComputation`] (worker thread, pure) and [`ResultApplier`]
//! (owning thread, with the staleness re-check).

use std::fmt;

use crate::error::{ApplyOutcome, ComputeError, SubmitError};
use crate::fingerprint::Fingerprint;
use crate::id::{PartitionId, VersionToken};

/// Type bundle describing one subsystem plugged into the pipeline.
pub trait Subsystem: Send + Sync + 'static {
    /// What a request is about (a position, a structure, an explosion).
    type Identity: Clone + fmt::Debug + Send + Sync + 'static;
    /// Live state owned by the owning thread. Never crosses threads
    /// through the pipeline.
    type State;
    /// Owned, worker-safe copy of the inputs a computation needs.
    type Snapshot: Send + 'static;
    /// The value a computation produces.
    type Output: Clone + Send + 'static;
}

/// A snapshot paired with the version token observed at capture time.
#[derive(Clone, Debug)]
pub struct Captured<T> {
    /// The captured data.
    pub snapshot: T,
    /// Live-state version when `snapshot` was taken.
    pub version: VersionToken,
}

impl<T> Captured<T> {
    /// Pair a snapshot with its version.
    pub fn new(snapshot: T, version: VersionToken) -> Self {
        Self { snapshot, version }
    }
}

/// Keys identities and captures snapshots on the owning thread.
pub trait SnapshotSource<S: Subsystem>: Send + Sync {
    /// Deterministic key for `identity`.
    fn fingerprint(&self, identity: &S::Identity) -> Fingerprint;

    /// Copy what the computation for `identity` needs out of `state`.
    ///
    /// Returns `None` when the identity is no longer valid; callers
    /// treat that as "nothing to do".
    fn capture(&self, state: &S::State, identity: &S::Identity) -> Option<Captured<S::Snapshot>>;
}

/// The pure computation run on a worker thread.
///
/// Must only read the snapshot it is handed. A panic is caught by the
/// engine and reported as [`ComputeError::WorkerFailure`].
pub trait WorkerComputation<S: Subsystem>: Send + Sync {
    /// Produce the output for `snapshot`.
    fn compute(&self, snapshot: &S::Snapshot) -> Result<S::Output, ComputeError>;
}

/// Reconciles outputs against live state on the owning thread.
pub trait ResultApplier<S: Subsystem>: Send + Sync {
    /// Current version of the state `identity` depends on, or `None`
    /// if the identity no longer exists.
    fn current_version(&self, state: &S::State, identity: &S::Identity) -> Option<VersionToken>;

    /// Perform the mutation. Only called after the version check passed.
    fn apply_unchecked(&self, state: &mut S::State, identity: &S::Identity, output: &S::Output);

    /// Re-check the version and apply if it still matches.
    ///
    /// A vanished identity counts as [`ApplyOutcome::Stale`].
    fn apply(
        &self,
        state: &mut S::State,
        identity: &S::Identity,
        output: &S::Output,
        snapshot_version: VersionToken,
    ) -> ApplyOutcome {
        match self.current_version(state, identity) {
            Some(live) if live == snapshot_version => {
                self.apply_unchecked(state, identity, output);
                ApplyOutcome::Applied
            }
            _ => ApplyOutcome::Stale,
        }
    }
}

/// A unit of work for a worker pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded pool of worker threads.
pub trait WorkerPool: Send + Sync {
    /// Enqueue `job` without blocking.
    ///
    /// Fails with [`ComputeError::QueueSaturated`] when the queue is
    /// full and [`ComputeError::PoolUnavailable`] after shutdown.
    fn try_submit(&self, job: Job) -> Result<(), ComputeError>;

    /// Whether the pool can currently take work in a timely fashion.
    fn is_healthy(&self) -> bool;
}

/// One reading of tick performance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickSample {
    /// Duration of the most recent tick in milliseconds.
    pub mspt: f64,
    /// Ticks per second implied by the most recent tick.
    pub tps: f64,
    /// Mean TPS over the recent history window.
    pub average_tps: f64,
}

/// Supplies tick timing to admission control.
pub trait MetricsSource: Send + Sync {
    /// The latest sample.
    fn sample(&self) -> TickSample;
}

/// A callback run on the thread that owns a partition's state.
pub type OwnerJob<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Schedules callbacks onto the owning thread of a partition.
///
/// Callbacks addressed to the same partition run in submission order.
pub trait OwnerExecutor<S>: Send + Sync {
    /// Enqueue `job` for the owner of `partition`.
    fn run_on_owner(&self, partition: PartitionId, job: OwnerJob<S>) -> Result<(), SubmitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    impl Subsystem for Counter {
        type Identity = usize;
        type State = Vec<(u64, u32)>;
        type Snapshot = u32;
        type Output = u32;
    }

    struct Bump;

    impl ResultApplier<Counter> for Bump {
        fn current_version(&self, state: &Vec<(u64, u32)>, id: &usize) -> Option<VersionToken> {
            state.get(*id).map(|(v, _)| VersionToken(*v))
        }

        fn apply_unchecked(&self, state: &mut Vec<(u64, u32)>, id: &usize, out: &u32) {
            state[*id].1 = *out;
        }
    }

    #[test]
    fn apply_checks_version_before_mutating() {
        let mut state = vec![(1, 0), (5, 0)];
        assert_eq!(
            Bump.apply(&mut state, &0, &9, VersionToken(1)),
            ApplyOutcome::Applied
        );
        assert_eq!(state[0].1, 9);

        assert_eq!(
            Bump.apply(&mut state, &1, &9, VersionToken(4)),
            ApplyOutcome::Stale
        );
        assert_eq!(state[1].1, 0);
    }

    #[test]
    fn vanished_identity_is_stale() {
        let mut state = vec![(1, 0)];
        assert_eq!(
            Bump.apply(&mut state, &7, &9, VersionToken(1)),
            ApplyOutcome::Stale
        );
    }
}
