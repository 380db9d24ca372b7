//! Feedback-driven admission control.
//!
//! [`AdmissionController`] classifies load from the latest tick
//! duration and turns it into a stochastic submission policy. Work is
//! thinned out gradually as load rises instead of being cut off at a
//! hard threshold, which avoids oscillating between all and nothing.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use recon_core::MetricsSource;

use crate::config::{AdmissionConfig, ConfigError};
use crate::lock;

/// System load classification, in increasing severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoadLevel {
    /// Below target; everything is admitted.
    Normal,
    /// Between target and warning.
    Moderate,
    /// Between warning and critical.
    High,
    /// At or above critical.
    Critical,
}

impl LoadLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::Moderate,
            2 => Self::High,
            _ => Self::Critical,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Moderate => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "NORMAL",
            Self::Moderate => "MODERATE",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Read-only view of the controller's state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdmissionStats {
    /// Current level.
    pub level: LoadLevel,
    /// Current submission probability.
    pub submit_rate: f64,
    /// Consecutive High-or-Critical samples.
    pub consecutive_high: u32,
    /// Latest MSPT sample.
    pub last_mspt: f64,
    /// Samples observed since construction or reset.
    pub updates: u64,
}

impl fmt::Display for AdmissionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LoadBalancer: Level={} | Rate={:.0}% | ConsecutiveHigh={} | MSPT={:.2}",
            self.level,
            self.submit_rate * 100.0,
            self.consecutive_high,
            self.last_mspt,
        )
    }
}

/// Load classifier and stochastic admission policy.
///
/// Shared by the pipeline and the task smoothing scheduler; every
/// method takes `&self`.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    level: AtomicU8,
    consecutive_high: AtomicU32,
    last_mspt_bits: AtomicU64,
    updates: AtomicU64,
    rng: Mutex<ChaCha8Rng>,
}

impl AdmissionController {
    /// Create a controller at [`LoadLevel::Normal`].
    pub fn new(config: AdmissionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            level: AtomicU8::new(LoadLevel::Normal.as_u8()),
            consecutive_high: AtomicU32::new(0),
            last_mspt_bits: AtomicU64::new(0f64.to_bits()),
            updates: AtomicU64::new(0),
            rng: Mutex::new(rng),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn classify(&self, mspt: f64) -> LoadLevel {
        let c = &self.config;
        if mspt >= c.critical_mspt {
            LoadLevel::Critical
        } else if mspt >= c.warning_mspt {
            LoadLevel::High
        } else if mspt >= c.target_mspt {
            LoadLevel::Moderate
        } else {
            LoadLevel::Normal
        }
    }

    fn rate_for(&self, level: LoadLevel) -> f64 {
        match level {
            LoadLevel::Normal => 1.0,
            LoadLevel::Moderate => self.config.moderate_rate,
            LoadLevel::High => self.config.high_rate,
            LoadLevel::Critical => self.config.critical_rate,
        }
    }

    /// Feed one tick-duration sample, in milliseconds.
    ///
    /// High and Critical samples extend the consecutive-high streak;
    /// anything lower resets it. NaN samples are ignored.
    pub fn update_mspt(&self, mspt: f64) {
        if mspt.is_nan() {
            return;
        }
        let level = self.classify(mspt);
        if level >= LoadLevel::High {
            self.consecutive_high.fetch_add(1, Ordering::AcqRel);
        } else {
            self.consecutive_high.store(0, Ordering::Release);
        }
        self.last_mspt_bits.store(mspt.to_bits(), Ordering::Release);
        self.updates.fetch_add(1, Ordering::Relaxed);

        let old = LoadLevel::from_u8(self.level.swap(level.as_u8(), Ordering::AcqRel));
        if old != level {
            tracing::info!(
                from = %old,
                to = %level,
                mspt,
                rate = self.rate_for(level),
                "load level changed"
            );
        }
    }

    /// Feed the latest sample from `source`.
    pub fn observe(&self, source: &dyn MetricsSource) {
        self.update_mspt(source.sample().mspt);
    }

    /// Current load level.
    pub fn load_level(&self) -> LoadLevel {
        LoadLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Submission probability at the current level.
    pub fn submit_rate(&self) -> f64 {
        self.rate_for(self.load_level())
    }

    /// Length of the current High-or-Critical streak.
    pub fn consecutive_high(&self) -> u32 {
        self.consecutive_high.load(Ordering::Acquire)
    }

    /// Whether optional work should be submitted.
    ///
    /// Always true at Normal; otherwise true with probability
    /// [`submit_rate`](Self::submit_rate).
    pub fn should_submit(&self) -> bool {
        let level = self.load_level();
        if level == LoadLevel::Normal {
            return true;
        }
        let rate = self.rate_for(level);
        lock(&self.rng).gen::<f64>() < rate
    }

    /// Whether low-priority work should be skipped outright.
    ///
    /// True at Critical, or at High once the streak exceeds
    /// `high_streak_threshold`.
    pub fn should_skip_low_priority(&self) -> bool {
        match self.load_level() {
            LoadLevel::Critical => true,
            LoadLevel::High => self.consecutive_high() > self.config.high_streak_threshold,
            _ => false,
        }
    }

    /// Return to Normal and clear the streak.
    pub fn reset(&self) {
        self.level.store(LoadLevel::Normal.as_u8(), Ordering::Release);
        self.consecutive_high.store(0, Ordering::Release);
        self.last_mspt_bits.store(0f64.to_bits(), Ordering::Release);
        self.updates.store(0, Ordering::Release);
    }

    /// Snapshot of the controller's state.
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            level: self.load_level(),
            submit_rate: self.submit_rate(),
            consecutive_high: self.consecutive_high(),
            last_mspt: f64::from_bits(self.last_mspt_bits.load(Ordering::Acquire)),
            updates: self.updates.load(Ordering::Relaxed),
        }
    }
}

// Compile-time assertion: AdmissionController must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<AdmissionController>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::TickSample;

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionConfig::default()).unwrap()
    }

    #[test]
    fn classifies_by_threshold() {
        let c = controller();
        for (mspt, level) in [
            (10.0, LoadLevel::Normal),
            (29.99, LoadLevel::Normal),
            (30.0, LoadLevel::Moderate),
            (40.0, LoadLevel::High),
            (44.9, LoadLevel::High),
            (45.0, LoadLevel::Critical),
            (500.0, LoadLevel::Critical),
        ] {
            c.update_mspt(mspt);
            assert_eq!(c.load_level(), level, "mspt {mspt}");
        }
    }

    #[test]
    fn rates_follow_level() {
        let c = controller();
        c.update_mspt(35.0);
        assert_eq!(c.submit_rate(), 0.85);
        c.update_mspt(42.0);
        assert_eq!(c.submit_rate(), 0.6);
        c.update_mspt(50.0);
        assert_eq!(c.submit_rate(), 0.3);
        c.update_mspt(5.0);
        assert_eq!(c.submit_rate(), 1.0);
    }

    #[test]
    fn normal_always_submits() {
        let c = controller();
        assert!((0..1000).all(|_| c.should_submit()));
    }

    #[test]
    fn critical_submits_roughly_at_rate() {
        let c = controller();
        c.update_mspt(100.0);
        let admitted = (0..10_000).filter(|_| c.should_submit()).count();
        assert!((2500..3500).contains(&admitted), "admitted {admitted}");
    }

    #[test]
    fn skip_low_needs_sustained_high() {
        let c = controller();
        for i in 1..=4 {
            c.update_mspt(42.0);
            assert_eq!(c.consecutive_high(), i);
            assert_eq!(c.should_skip_low_priority(), i == 4, "after sample {i}");
        }
        c.update_mspt(35.0);
        assert!(!c.should_skip_low_priority());
        assert_eq!(c.consecutive_high(), 0);
    }

    #[test]
    fn critical_skips_low_immediately() {
        let c = controller();
        c.update_mspt(46.0);
        assert!(c.should_skip_low_priority());
    }

    #[test]
    fn nan_samples_are_ignored() {
        let c = controller();
        c.update_mspt(46.0);
        c.update_mspt(f64::NAN);
        assert_eq!(c.load_level(), LoadLevel::Critical);
        assert_eq!(c.stats().updates, 1);
    }

    #[test]
    fn observe_reads_metrics_source() {
        struct Fixed(f64);
        impl MetricsSource for Fixed {
            fn sample(&self) -> TickSample {
                TickSample {
                    mspt: self.0,
                    tps: 20.0,
                    average_tps: 20.0,
                }
            }
        }
        let c = controller();
        c.observe(&Fixed(41.0));
        assert_eq!(c.load_level(), LoadLevel::High);
    }

    #[test]
    fn reset_returns_to_normal() {
        let c = controller();
        for _ in 0..5 {
            c.update_mspt(50.0);
        }
        c.reset();
        let s = c.stats();
        assert_eq!(s.level, LoadLevel::Normal);
        assert_eq!(s.consecutive_high, 0);
        assert_eq!(s.submit_rate, 1.0);
    }

    #[test]
    fn stats_display() {
        let c = controller();
        c.update_mspt(42.0);
        assert_eq!(
            c.stats().to_string(),
            "LoadBalancer: Level=HIGH | Rate=60% | ConsecutiveHigh=1 | MSPT=42.00"
        );
    }
}
