//! Per-key rate limiting for repetitive warnings.
//!
//! A worker that fails on every tick would otherwise flood the log.
//! [`ThrottledLog`] lets the first occurrence of each key through per
//! window and counts the rest; the suppressed count rides along with
//! the next event that is let through.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use recon_core::{Clock, MonotonicClock};

#[derive(Debug)]
struct KeyState {
    window_start: Instant,
    suppressed: u64,
    total: u64,
}

/// Rate limiter keyed by `component:operation` strings.
///
/// ```
/// use recon_engine::ThrottledLog;
/// use std::time::Duration;
///
/// let log = ThrottledLog::new(Duration::from_secs(60));
/// if let Some(suppressed) = log.check("pipeline:timeout") {
///     tracing::warn!(suppressed, "worker timed out");
/// }
/// assert_eq!(log.check("pipeline:timeout"), None);
/// assert_eq!(log.count("pipeline:timeout"), 2);
/// ```
#[derive(Debug)]
pub struct ThrottledLog {
    window: Duration,
    clock: Arc<dyn Clock>,
    keys: DashMap<String, KeyState>,
}

impl ThrottledLog {
    /// Limiter on the monotonic clock.
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Arc::new(MonotonicClock))
    }

    /// Limiter reading time from `clock`.
    pub fn with_clock(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            keys: DashMap::new(),
        }
    }

    /// Record one occurrence of `key`.
    ///
    /// Returns `Some(suppressed)` when the caller should emit its event,
    /// where `suppressed` is how many occurrences were swallowed since
    /// the last emitted one. Returns `None` inside the window.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        let mut state = self.keys.entry(key.to_owned()).or_insert_with(|| KeyState {
            window_start: now,
            suppressed: 0,
            total: 0,
        });
        state.total += 1;
        if state.total == 1 {
            return Some(0);
        }
        if now.saturating_duration_since(state.window_start) >= self.window {
            let suppressed = std::mem::take(&mut state.suppressed);
            state.window_start = now;
            return Some(suppressed);
        }
        state.suppressed += 1;
        None
    }

    /// Total occurrences recorded for `key`.
    pub fn count(&self, key: &str) -> u64 {
        self.keys.get(key).map_or(0, |s| s.total)
    }

    /// `(key, total)` for every key seen, sorted by key.
    pub fn counts(&self) -> Vec<(String, u64)> {
        let mut v: Vec<_> = self
            .keys
            .iter()
            .map(|e| (e.key().clone(), e.value().total))
            .collect();
        v.sort();
        v
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::ManualClock;

    #[test]
    fn first_event_per_window_passes() {
        let clock = Arc::new(ManualClock::new());
        let log = ThrottledLog::with_clock(Duration::from_secs(60), clock.clone());
        assert_eq!(log.check("a:b"), Some(0));
        assert_eq!(log.check("a:b"), None);
        assert_eq!(log.check("a:b"), None);
        clock.advance(Duration::from_secs(60));
        assert_eq!(log.check("a:b"), Some(2));
        assert_eq!(log.check("a:b"), None);
        assert_eq!(log.count("a:b"), 5);
    }

    #[test]
    fn concurrent_first_sightings_share_one_count() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 250;
        let log = ThrottledLog::new(Duration::from_secs(60));
        let emitted: u64 = std::thread::scope(|s| {
            let joins: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..PER_THREAD)
                            .filter(|_| log.check("pool:refused").is_some())
                            .count() as u64
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).sum()
        });
        assert_eq!(log.count("pool:refused"), THREADS * PER_THREAD);
        assert_eq!(emitted, 1);
    }

    #[test]
    fn keys_are_independent() {
        let log = ThrottledLog::new(Duration::from_secs(60));
        assert_eq!(log.check("x"), Some(0));
        assert_eq!(log.check("y"), Some(0));
        assert_eq!(log.counts(), vec![("x".into(), 1), ("y".into(), 1)]);
        log.clear();
        assert_eq!(log.count("x"), 0);
    }
}
