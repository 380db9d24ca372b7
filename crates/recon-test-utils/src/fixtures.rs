//! The [`NetworkScan`] subsystem and its strategy fixtures.
//!
//! - [`SumComputation`]: sums the snapshot immediately.
//! - [`SlowComputation`]: sleeps, then sums.
//! - [`GatedComputation`]: blocks until its [`Gate`] opens.
//! - [`FailingComputation`]: fails the first N calls.
//! - [`PanickingComputation`]: always panics.
//!
//! Every computation counts its calls in a shared [`CallCounter`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use recon_core::{
    Captured, CellPos, ComputeError, Fingerprint, ResultApplier, SnapshotSource, Subsystem,
    VersionToken, WorkerComputation,
};

use crate::{neighbourhood, GridWorld};

/// Neighbourhood-sum subsystem over a [`GridWorld`], keyed by position.
pub struct NetworkScan;

impl Subsystem for NetworkScan {
    type Identity = CellPos;
    type State = GridWorld;
    type Snapshot = ScanSnapshot;
    type Output = u64;
}

/// Owned copy of a neighbourhood's values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanSnapshot {
    pub center: CellPos,
    pub values: Vec<u32>,
}

impl ScanSnapshot {
    pub fn sum(&self) -> u64 {
        self.values.iter().map(|v| u64::from(*v)).sum()
    }
}

/// Shared call counter.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

// ── Source and applier ──────────────────────────────────────────────

/// Spatial fingerprints; captures the neighbourhood's values and the
/// centre cell's version.
#[derive(Clone, Debug, Default)]
pub struct GridSource {
    pub captures: CallCounter,
}

impl SnapshotSource<NetworkScan> for GridSource {
    fn fingerprint(&self, pos: &CellPos) -> Fingerprint {
        Fingerprint::spatial(*pos)
    }

    fn capture(&self, world: &GridWorld, pos: &CellPos) -> Option<Captured<ScanSnapshot>> {
        self.captures.hit();
        let version = world.version(*pos)?;
        let values = neighbourhood(*pos)
            .filter_map(|p| world.get(p))
            .map(|c| c.value)
            .collect();
        Some(Captured::new(
            ScanSnapshot {
                center: *pos,
                values,
            },
            version,
        ))
    }
}

/// Records outputs in the world's applied map.
#[derive(Clone, Debug, Default)]
pub struct GridApplier;

impl ResultApplier<NetworkScan> for GridApplier {
    fn current_version(&self, world: &GridWorld, pos: &CellPos) -> Option<VersionToken> {
        world.version(*pos)
    }

    fn apply_unchecked(&self, world: &mut GridWorld, pos: &CellPos, output: &u64) {
        world.record_apply(*pos, *output);
    }
}

// ── Computations ────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct SumComputation {
    pub calls: CallCounter,
}

impl WorkerComputation<NetworkScan> for SumComputation {
    fn compute(&self, snapshot: &ScanSnapshot) -> Result<u64, ComputeError> {
        self.calls.hit();
        Ok(snapshot.sum())
    }
}

#[derive(Clone, Debug)]
pub struct SlowComputation {
    pub delay: Duration,
    pub calls: CallCounter,
}

impl SlowComputation {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: CallCounter::new(),
        }
    }
}

impl WorkerComputation<NetworkScan> for SlowComputation {
    fn compute(&self, snapshot: &ScanSnapshot) -> Result<u64, ComputeError> {
        self.calls.hit();
        thread::sleep(self.delay);
        Ok(snapshot.sum())
    }
}

/// Blocks computations until opened. Dropping the gate also opens it.
#[derive(Debug)]
pub struct Gate {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self { tx: Some(tx), rx }
    }

    /// Release every waiting and future computation.
    pub fn open(&mut self) {
        self.tx.take();
    }

    fn waiter(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct GatedComputation {
    wait: Receiver<()>,
    pub calls: CallCounter,
}

impl GatedComputation {
    pub fn new(gate: &Gate) -> Self {
        Self {
            wait: gate.waiter(),
            calls: CallCounter::new(),
        }
    }
}

impl WorkerComputation<NetworkScan> for GatedComputation {
    fn compute(&self, snapshot: &ScanSnapshot) -> Result<u64, ComputeError> {
        self.calls.hit();
        // Returns once every sender is gone.
        let _ = self.wait.recv();
        Ok(snapshot.sum())
    }
}

#[derive(Clone, Debug)]
pub struct FailingComputation {
    pub fail_first: usize,
    pub calls: CallCounter,
}

impl FailingComputation {
    pub fn new(fail_first: usize) -> Self {
        Self {
            fail_first,
            calls: CallCounter::new(),
        }
    }

    pub fn always() -> Self {
        Self::new(usize::MAX)
    }
}

impl WorkerComputation<NetworkScan> for FailingComputation {
    fn compute(&self, snapshot: &ScanSnapshot) -> Result<u64, ComputeError> {
        if self.calls.hit() < self.fail_first {
            return Err(ComputeError::failure(format!(
                "scan at {} failed",
                snapshot.center
            )));
        }
        Ok(snapshot.sum())
    }
}

#[derive(Clone, Debug, Default)]
pub struct PanickingComputation {
    pub calls: CallCounter,
}

impl WorkerComputation<NetworkScan> for PanickingComputation {
    fn compute(&self, snapshot: &ScanSnapshot) -> Result<u64, ComputeError> {
        self.calls.hit();
        panic!("scan at {} exploded", snapshot.center);
    }
}
