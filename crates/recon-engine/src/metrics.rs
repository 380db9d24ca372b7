//! Tick-rate tracking.
//!
//! [`TickRateTracker`] turns tick durations into the MSPT / TPS figures
//! admission control and the task smoothing scheduler consume.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use recon_core::{MetricsSource, TickSample};

use crate::lock;

/// Number of TPS samples averaged by [`TickRateTracker::average_tps`].
pub const HISTORY_LIMIT: usize = 40;

#[derive(Debug)]
struct TrackerState {
    last_mspt: Option<f64>,
    last_tick_at: Option<Instant>,
    history: VecDeque<f64>,
    missed_ticks: f64,
    ticks: u64,
}

/// Rolling tick-duration tracker.
///
/// Each sample is one tick's duration in milliseconds, either measured
/// by the caller ([`record_tick`](Self::record_tick)) or taken as the
/// wall-clock interval between calls to [`on_tick`](Self::on_tick).
/// TPS is capped at `1000 / nominal_tick_ms` (20 for the default 50 ms
/// tick). Ticks longer than nominal accumulate fractional missed ticks.
#[derive(Debug)]
pub struct TickRateTracker {
    nominal: Duration,
    state: Mutex<TrackerState>,
}

impl Default for TickRateTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl TickRateTracker {
    /// Tracker for ticks of `nominal` length.
    pub fn new(nominal: Duration) -> Self {
        let nominal = if nominal.is_zero() {
            Duration::from_millis(50)
        } else {
            nominal
        };
        Self {
            nominal,
            state: Mutex::new(TrackerState {
                last_mspt: None,
                last_tick_at: None,
                history: VecDeque::with_capacity(HISTORY_LIMIT),
                missed_ticks: 0.0,
                ticks: 0,
            }),
        }
    }

    fn nominal_ms(&self) -> f64 {
        self.nominal.as_secs_f64() * 1000.0
    }

    /// Highest reportable TPS.
    pub fn max_tps(&self) -> f64 {
        1000.0 / self.nominal_ms()
    }

    fn tps_for(&self, mspt: f64) -> f64 {
        if mspt <= 0.0 {
            self.max_tps()
        } else {
            (1000.0 / mspt).min(self.max_tps())
        }
    }

    /// Record a tick that took `duration`.
    pub fn record_tick(&self, duration: Duration) {
        let mspt = duration.as_secs_f64() * 1000.0;
        let mut st = lock(&self.state);
        self.push(&mut st, mspt);
    }

    /// Record a tick boundary now; the sample is the time since the
    /// previous boundary. The first call only starts the clock.
    pub fn on_tick(&self) {
        let now = Instant::now();
        let mut st = lock(&self.state);
        if let Some(prev) = st.last_tick_at.replace(now) {
            let mspt = now.duration_since(prev).as_secs_f64() * 1000.0;
            self.push(&mut st, mspt);
        }
    }

    fn push(&self, st: &mut TrackerState, mspt: f64) {
        let mspt = if mspt > 0.0 { mspt } else { self.nominal_ms() };
        st.last_mspt = Some(mspt);
        st.ticks += 1;
        if st.history.len() >= HISTORY_LIMIT {
            st.history.pop_front();
        }
        st.history.push_back(self.tps_for(mspt));

        // Whole missed ticks are consumed on the next sample.
        st.missed_ticks -= st.missed_ticks.floor();
        if mspt > self.nominal_ms() {
            st.missed_ticks += mspt / self.nominal_ms() - 1.0;
        }
    }

    /// Duration of the latest tick in milliseconds (nominal before any sample).
    pub fn mspt(&self) -> f64 {
        lock(&self.state).last_mspt.unwrap_or_else(|| self.nominal_ms())
    }

    /// TPS implied by the latest tick.
    pub fn tps(&self) -> f64 {
        self.tps_for(self.mspt())
    }

    /// Mean TPS over the last [`HISTORY_LIMIT`] samples.
    pub fn average_tps(&self) -> f64 {
        let st = lock(&self.state);
        if st.history.is_empty() {
            self.max_tps()
        } else {
            st.history.iter().sum::<f64>() / st.history.len() as f64
        }
    }

    /// The lower of current and average TPS.
    pub fn most_accurate_tps(&self) -> f64 {
        self.tps().min(self.average_tps())
    }

    /// Scale a tick count by the current speed of the simulation, so
    /// time-based effects keep real-time pacing under lag.
    pub fn scale_ticks(&self, ticks: f64) -> f64 {
        ticks * self.most_accurate_tps() / self.max_tps()
    }

    /// Whole ticks missed so far, not yet consumed.
    pub fn applicable_missed_ticks(&self) -> u64 {
        lock(&self.state).missed_ticks.floor() as u64
    }

    /// Fractional missed-tick accumulator.
    pub fn missed_ticks(&self) -> f64 {
        lock(&self.state).missed_ticks
    }

    /// Zero the missed-tick accumulator.
    pub fn reset_missed_ticks(&self) {
        lock(&self.state).missed_ticks = 0.0;
    }

    /// Samples recorded so far.
    pub fn tick_count(&self) -> u64 {
        lock(&self.state).ticks
    }
}

impl MetricsSource for TickRateTracker {
    fn sample(&self) -> TickSample {
        let mspt = self.mspt();
        TickSample {
            mspt,
            tps: self.tps_for(mspt),
            average_tps: self.average_tps(),
        }
    }
}
