//! Shared completion slots for in-flight computations.
//!
//! Every in-flight computation owns one [`PendingSlot`]. The worker
//! deposits its raw result, the owning thread claims it, applies it,
//! and publishes the final [`Resolution`]. Callers that attached to the
//! same key hold a [`Handle`] onto the slot and all observe that one
//! resolution.
//!
//! ```text
//!   Running ──complete──▶ Computed ──take──▶ Claimed ──resolve──▶ Resolved
//!      │                                       ▲  │
//!      └───────────────claim_running───────────┘  └─rearm─▶ Running
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use recon_core::{ComputeError, Fingerprint, Resolution};

use crate::lock;

enum SlotState<R> {
    Running,
    Computed(Result<R, ComputeError>),
    Claimed,
    Resolved(Resolution<R>),
}

/// Outcome of [`PendingSlot::wait_computed`].
pub(crate) enum Waited<R> {
    /// The raw worker result; the slot is now claimed by the caller.
    Computed(Result<R, ComputeError>),
    /// Someone else already resolved the slot.
    Resolved(Resolution<R>),
    /// Deadline passed with the computation still outstanding.
    TimedOut,
}

pub(crate) struct PendingSlot<R> {
    key: Fingerprint,
    state: Mutex<SlotState<R>>,
    changed: Condvar,
    cancelled: AtomicBool,
}

impl<R> PendingSlot<R> {
    pub(crate) fn key(&self) -> Fingerprint {
        self.key
    }

    fn phase(&self) -> &'static str {
        match &*lock(&self.state) {
            SlotState::Running => "running",
            SlotState::Computed(_) => "computed",
            SlotState::Claimed => "claimed",
            SlotState::Resolved(_) => "resolved",
        }
    }
}

impl<R: Clone> PendingSlot<R> {
    pub(crate) fn new(key: Fingerprint) -> Self {
        Self {
            key,
            state: Mutex::new(SlotState::Running),
            changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// A slot whose result is already known but not yet applied.
    pub(crate) fn computed(key: Fingerprint, result: Result<R, ComputeError>) -> Self {
        Self {
            state: Mutex::new(SlotState::Computed(result)),
            ..Self::new(key)
        }
    }

    /// Whether the owning thread gave up on the worker.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Deposit a worker result. Returns false if the slot was claimed
    /// in the meantime, in which case the result is discarded.
    pub(crate) fn complete(&self, result: Result<R, ComputeError>) -> bool {
        let mut state = lock(&self.state);
        if !matches!(*state, SlotState::Running) {
            return false;
        }
        *state = SlotState::Computed(result);
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Claim a deposited result, if there is one.
    pub(crate) fn take_computed(&self) -> Option<Result<R, ComputeError>> {
        let mut state = lock(&self.state);
        if !matches!(*state, SlotState::Computed(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, SlotState::Claimed) {
            SlotState::Computed(result) => Some(result),
            _ => None,
        }
    }

    /// Give up on a still-running computation and claim the slot.
    pub(crate) fn claim_running(&self) -> bool {
        let mut state = lock(&self.state);
        if !matches!(*state, SlotState::Running) {
            return false;
        }
        *state = SlotState::Claimed;
        self.cancelled.store(true, Ordering::Release);
        true
    }

    /// Put a claimed slot back to running for a retry.
    pub(crate) fn rearm(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, SlotState::Claimed) {
            *state = SlotState::Running;
            self.cancelled.store(false, Ordering::Release);
        }
    }

    /// Publish the final resolution. Returns false if one was already
    /// published; the first resolution wins.
    pub(crate) fn resolve(&self, resolution: Resolution<R>) -> bool {
        let mut state = lock(&self.state);
        if matches!(*state, SlotState::Resolved(_)) {
            return false;
        }
        *state = SlotState::Resolved(resolution);
        self.cancelled.store(true, Ordering::Release);
        drop(state);
        self.changed.notify_all();
        true
    }

    /// Wait until the worker result arrives (claiming it) or the slot is
    /// resolved, giving up at `deadline`.
    pub(crate) fn wait_computed(&self, deadline: Instant) -> Waited<R> {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                SlotState::Computed(_) => {
                    if let SlotState::Computed(result) =
                        std::mem::replace(&mut *state, SlotState::Claimed)
                    {
                        return Waited::Computed(result);
                    }
                }
                SlotState::Resolved(r) => return Waited::Resolved(r.clone()),
                SlotState::Running | SlotState::Claimed => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Waited::TimedOut;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wait for the final resolution until `deadline`.
    pub(crate) fn wait_resolved(&self, deadline: Instant) -> Option<Resolution<R>> {
        let mut state = lock(&self.state);
        loop {
            if let SlotState::Resolved(r) = &*state {
                return Some(r.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn resolution(&self) -> Option<Resolution<R>> {
        match &*lock(&self.state) {
            SlotState::Resolved(r) => Some(r.clone()),
            _ => None,
        }
    }
}

// ── Handle ─────────────────────────────────────────────────────────

/// Shared view of an in-flight computation's eventual [`Resolution`].
///
/// Background results are applied by
/// [`AsyncPipeline::drain_completions`](crate::pipeline::AsyncPipeline::drain_completions)
/// on the owning thread, so waiting on a handle from that same thread
/// without draining only ever times out.
pub struct Handle<R> {
    slot: Arc<PendingSlot<R>>,
}

impl<R: Clone> Handle<R> {
    pub(crate) fn new(slot: Arc<PendingSlot<R>>) -> Self {
        Self { slot }
    }

    /// Fingerprint of the computation.
    pub fn key(&self) -> Fingerprint {
        self.slot.key()
    }

    /// The resolution, if already published.
    pub fn try_get(&self) -> Option<Resolution<R>> {
        self.slot.resolution()
    }

    /// Whether the resolution has been published.
    pub fn is_resolved(&self) -> bool {
        self.try_get().is_some()
    }

    /// Block for up to `timeout` waiting for the resolution.
    pub fn wait(&self, timeout: Duration) -> Option<Resolution<R>> {
        self.slot.wait_resolved(Instant::now() + timeout)
    }

    /// Whether both handles observe the same computation.
    pub fn same_computation(&self, other: &Handle<R>) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<R> Clone for Handle<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<R> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.slot.key())
            .field("phase", &self.slot.phase())
            .finish()
    }
}
