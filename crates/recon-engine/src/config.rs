//! Engine configuration structs and validation errors.
//!
//! Every struct documents its defaults and exposes `validate()`, which
//! checks structural invariants before any thread is spawned. Loading
//! these from files is left to the embedding application.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use recon_cache::{CacheConfig, CacheConfigError};

// ── PoolConfig ─────────────────────────────────────────────────────

/// Configuration for [`ThreadPool`](crate::pool::ThreadPool).
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Number of worker threads. `None` = auto-detect
    /// (`available_parallelism / 2`, clamped to `[2, 16]`).
    pub worker_count: Option<usize>,
    /// Job queue slots per worker. Default: 64.
    pub queue_capacity_per_worker: usize,
    /// Queue occupancy fraction above which the pool reports itself
    /// unhealthy. Default: 0.9.
    pub unhealthy_occupancy: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            queue_capacity_per_worker: 64,
            unhealthy_occupancy: 0.9,
        }
    }
}

impl PoolConfig {
    /// Resolve the actual worker count, applying auto-detection if `None`.
    ///
    /// Explicit values are clamped to `[1, 64]`.
    pub fn resolved_worker_count(&self) -> usize {
        match self.worker_count {
            Some(n) => n.clamp(1, 64),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                (cpus / 2).clamp(2, 16)
            }
        }
    }

    /// Total job queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.resolved_worker_count() * self.queue_capacity_per_worker
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity_per_worker == 0 {
            return Err(ConfigError::ZeroCapacity {
                what: "queue_capacity_per_worker",
            });
        }
        check_fraction("unhealthy_occupancy", self.unhealthy_occupancy)
    }
}

// ── AdmissionConfig ────────────────────────────────────────────────

/// Configuration for [`AdmissionController`](crate::admission::AdmissionController).
///
/// Tick durations below `target_mspt` are Normal, below `warning_mspt`
/// Moderate, below `critical_mspt` High, and anything else Critical.
#[derive(Clone, Debug, PartialEq)]
pub struct AdmissionConfig {
    /// Start of the Moderate band, in milliseconds. Default: 30.
    pub target_mspt: f64,
    /// Start of the High band. Default: 40.
    pub warning_mspt: f64,
    /// Start of the Critical band. Default: 45.
    pub critical_mspt: f64,
    /// Low-priority work is skipped at High once more than this many
    /// consecutive samples were High or Critical. Default: 3.
    pub high_streak_threshold: u32,
    /// Submission probability at Moderate. Default: 0.85.
    pub moderate_rate: f64,
    /// Submission probability at High. Default: 0.6.
    pub high_rate: f64,
    /// Submission probability at Critical. Default: 0.3.
    pub critical_rate: f64,
    /// Seed for the admission sampler. Default: 0.
    pub seed: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            target_mspt: 30.0,
            warning_mspt: 40.0,
            critical_mspt: 45.0,
            high_streak_threshold: 3,
            moderate_rate: 0.85,
            high_rate: 0.6,
            critical_rate: 0.3,
            seed: 0,
        }
    }
}

impl AdmissionConfig {
    /// Check structural invariants.
    ///
    /// Thresholds must be finite, positive and strictly increasing.
    /// Rates must lie in `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = [self.target_mspt, self.warning_mspt, self.critical_mspt];
        if t.iter().any(|v| !v.is_finite() || *v <= 0.0) || !(t[0] < t[1] && t[1] < t[2]) {
            return Err(ConfigError::InvalidThresholds {
                target: t[0],
                warning: t[1],
                critical: t[2],
            });
        }
        check_fraction("moderate_rate", self.moderate_rate)?;
        check_fraction("high_rate", self.high_rate)?;
        check_fraction("critical_rate", self.critical_rate)
    }
}

// ── SchedulerConfig ────────────────────────────────────────────────

/// Configuration for [`TaskSmoothingScheduler`](crate::scheduler::TaskSmoothingScheduler).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Queue capacity. Default: 1000.
    pub max_queue_size: usize,
    /// Base dispatch budget per tick before TPS scaling. Default: 20.
    pub max_tasks_per_tick: usize,
    /// How long the dispatch thread parks when idle. Default: 10 ms.
    pub idle_poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_tasks_per_tick: 20,
            idle_poll: Duration::from_millis(10),
        }
    }
}

impl SchedulerConfig {
    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroCapacity {
                what: "max_queue_size",
            });
        }
        if self.max_tasks_per_tick == 0 {
            return Err(ConfigError::ZeroCapacity {
                what: "max_tasks_per_tick",
            });
        }
        check_duration("idle_poll", self.idle_poll)
    }
}

// ── PipelineConfig ─────────────────────────────────────────────────

/// Configuration for [`AsyncPipeline`](crate::pipeline::AsyncPipeline).
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Pipeline name, used as the scheduler category and in logs.
    /// Default: `"pipeline"`.
    pub name: String,
    /// Longest `resolve_now` blocks on a worker before falling back.
    /// Default: 50 ms.
    pub critical_timeout: Duration,
    /// Age after which `drain_completions` gives up on a background
    /// computation. Requests made with `OverloadPolicy::Drop` resolve as
    /// dropped; the rest fall back. Default: 250 ms.
    pub background_timeout: Duration,
    /// Most timed-out computations one `drain_completions` pass resolves
    /// by synchronous fallback. The rest wait for the next pass.
    /// Default: 8.
    pub max_fallbacks_per_drain: usize,
    /// Resubmit a background result that applied stale once before
    /// falling back. Default: true.
    pub retry_stale_once: bool,
    /// How long a failed key short-circuits to a no-op. `None`
    /// disables the negative cache. Default: `None`.
    pub negative_ttl: Option<Duration>,
    /// Probability that a negatively cached key is retried anyway.
    /// Default: 0.1.
    pub retry_probability: f64,
    /// Window for throttled warnings. Default: 60 s.
    pub log_window: Duration,
    /// Seed for negative-cache retry sampling. Default: 0.
    pub seed: u64,
    /// Result cache configuration.
    pub cache: CacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".into(),
            critical_timeout: Duration::from_millis(50),
            background_timeout: Duration::from_millis(250),
            max_fallbacks_per_drain: 8,
            retry_stale_once: true,
            negative_ttl: None,
            retry_probability: 0.1,
            log_window: Duration::from_secs(60),
            seed: 0,
            cache: CacheConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Default configuration under a given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("critical_timeout", self.critical_timeout)?;
        check_duration("background_timeout", self.background_timeout)?;
        if self.max_fallbacks_per_drain == 0 {
            return Err(ConfigError::ZeroCapacity {
                what: "max_fallbacks_per_drain",
            });
        }
        check_duration("log_window", self.log_window)?;
        if let Some(ttl) = self.negative_ttl {
            check_duration("negative_ttl", ttl)?;
        }
        check_fraction("retry_probability", self.retry_probability)?;
        self.cache.validate()?;
        Ok(())
    }
}

// ── OwnerConfig ────────────────────────────────────────────────────

/// Configuration for [`OwnerThread`](crate::owner::OwnerThread).
#[derive(Clone, Debug, PartialEq)]
pub struct OwnerConfig {
    /// Thread name. Default: `"recon-owner"`.
    pub name: String,
    /// Target tick rate. Default: 20 Hz.
    pub tick_rate_hz: f64,
    /// Mailbox capacity. Default: 1024.
    pub mailbox_capacity: usize,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            name: "recon-owner".into(),
            tick_rate_hz: 20.0,
            mailbox_capacity: 1024,
        }
    }
}

impl OwnerConfig {
    /// Duration of one tick at the configured rate.
    pub fn tick_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tick_rate_hz.is_finite() || self.tick_rate_hz <= 0.0 {
            return Err(ConfigError::InvalidTickRate {
                value: self.tick_rate_hz,
            });
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                what: "mailbox_capacity",
            });
        }
        Ok(())
    }
}

fn check_fraction(what: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidFraction { what, value })
    }
}

fn check_duration(what: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::ZeroDuration { what })
    } else {
        Ok(())
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected while validating configuration or starting threads.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// Cache configuration is invalid.
    Cache(CacheConfigError),
    /// A capacity or budget is zero.
    ZeroCapacity {
        /// Name of the offending field.
        what: &'static str,
    },
    /// A timeout or interval is zero.
    ZeroDuration {
        /// Name of the offending field.
        what: &'static str,
    },
    /// A probability or fraction lies outside `[0, 1]` (or is NaN).
    InvalidFraction {
        /// Name of the offending field.
        what: &'static str,
        /// The invalid value.
        value: f64,
    },
    /// Admission thresholds are not finite, positive and increasing.
    InvalidThresholds {
        /// Configured target.
        target: f64,
        /// Configured warning.
        warning: f64,
        /// Configured critical.
        critical: f64,
    },
    /// tick_rate_hz is NaN, infinite, zero, or negative.
    InvalidTickRate {
        /// The invalid value.
        value: f64,
    },
    /// A background thread could not be spawned.
    ThreadSpawnFailed {
        /// Description of which thread failed.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache(e) => write!(f, "cache: {e}"),
            Self::ZeroCapacity { what } => write!(f, "{what} must be at least 1"),
            Self::ZeroDuration { what } => write!(f, "{what} must be non-zero"),
            Self::InvalidFraction { what, value } => {
                write!(f, "{what} must lie in [0, 1], got {value}")
            }
            Self::InvalidThresholds {
                target,
                warning,
                critical,
            } => write!(
                f,
                "admission thresholds must be positive and increasing, got {target} / {warning} / {critical}"
            ),
            Self::InvalidTickRate { value } => {
                write!(f, "tick_rate_hz must be finite and positive, got {value}")
            }
            Self::ThreadSpawnFailed { reason } => write!(f, "thread spawn failed: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheConfigError> for ConfigError {
    fn from(e: CacheConfigError) -> Self {
        Self::Cache(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(AdmissionConfig::default().validate().is_ok());
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(OwnerConfig::default().validate().is_ok());
    }

    #[test]
    fn auto_worker_count_is_clamped() {
        let n = PoolConfig::default().resolved_worker_count();
        assert!((2..=16).contains(&n));
        let cfg = PoolConfig {
            worker_count: Some(0),
            ..PoolConfig::default()
        };
        assert_eq!(cfg.resolved_worker_count(), 1);
    }

    #[test]
    fn thresholds_must_increase() {
        let cfg = AdmissionConfig {
            warning_mspt: 30.0,
            ..AdmissionConfig::default()
        };
        match cfg.validate() {
            Err(ConfigError::InvalidThresholds { .. }) => {}
            other => panic!("expected InvalidThresholds, got {other:?}"),
        }
        let cfg = AdmissionConfig {
            critical_mspt: f64::NAN,
            ..AdmissionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rates_must_be_probabilities() {
        let cfg = AdmissionConfig {
            high_rate: 1.5,
            ..AdmissionConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidFraction {
                what: "high_rate",
                value: 1.5
            })
        );
        let cfg = PipelineConfig {
            retry_probability: -0.1,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pipeline_rejects_zero_timeouts_and_bad_cache() {
        let cfg = PipelineConfig {
            critical_timeout: Duration::ZERO,
            ..PipelineConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroDuration {
                what: "critical_timeout"
            })
        );

        let cfg = PipelineConfig {
            max_fallbacks_per_drain: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroCapacity {
                what: "max_fallbacks_per_drain"
            })
        );

        let mut cfg = PipelineConfig::named("blast");
        cfg.cache.hot.capacity = 0;
        match cfg.validate() {
            Err(ConfigError::Cache(CacheConfigError::HotCapacityZero)) => {}
            other => panic!("expected Cache(HotCapacityZero), got {other:?}"),
        }
        assert_eq!(cfg.name, "blast");
    }

    #[test]
    fn owner_tick_rate_must_be_positive() {
        let cfg = OwnerConfig {
            tick_rate_hz: 0.0,
            ..OwnerConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidTickRate { value: 0.0 })
        );
        assert_eq!(
            OwnerConfig::default().tick_budget(),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn scheduler_rejects_zero_sizes() {
        let cfg = SchedulerConfig {
            max_queue_size: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroCapacity {
                what: "max_queue_size"
            })
        );
    }
}
