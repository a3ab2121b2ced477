//! Configuration management for fastlimiter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};

/// Prefix for environment variable overrides, e.g. `FASTLIMITER_BURST=5` or
/// `FASTLIMITER_PERIOD__MINUTES=1`.
pub const ENV_PREFIX: &str = "FASTLIMITER";

/// Refill period, expressed as the sum of its components.
///
/// Components may individually be negative; only the total has to be positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub hours: i64,
}

impl Period {
    pub fn new(seconds: i64, minutes: i64, hours: i64) -> Self {
        Self {
            seconds,
            minutes,
            hours,
        }
    }

    pub fn seconds(seconds: i64) -> Self {
        Self::new(seconds, 0, 0)
    }

    pub fn minutes(minutes: i64) -> Self {
        Self::new(0, minutes, 0)
    }

    pub fn hours(hours: i64) -> Self {
        Self::new(0, 0, hours)
    }

    /// Total length in seconds. Saturates instead of overflowing.
    pub fn total_seconds(&self) -> i64 {
        self.seconds
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.hours.saturating_mul(3600))
    }

    /// The period as a duration, rejecting non-positive totals.
    pub fn duration(&self) -> Result<Duration> {
        let total = self.total_seconds();
        if total <= 0 {
            return Err(LimiterError::InvalidConfiguration(
                "The total time must be greater than zero.".to_string(),
            ));
        }
        Ok(Duration::from_secs(total as u64))
    }
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Tokens added per period
    pub rate: u64,

    /// Refill period
    pub period: Period,

    /// Maximum number of tokens that can be stored
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Extra tokens allowed during bursts
    #[serde(default)]
    pub burst: u64,

    /// Stats history length, used both as a sample count and as seconds
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,

    /// Whether per-key statistics are collected
    #[serde(default = "default_enable_stats")]
    pub enable_stats: bool,
}

fn default_capacity() -> u64 {
    1024
}

fn default_stats_window() -> usize {
    60
}

fn default_enable_stats() -> bool {
    true
}

impl LimiterConfig {
    /// A configuration with default capacity, no burst and statistics on.
    pub fn new(rate: u64, period: Period) -> Self {
        Self {
            rate,
            period,
            capacity: default_capacity(),
            burst: 0,
            stats_window: default_stats_window(),
            enable_stats: default_enable_stats(),
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_stats_window(mut self, stats_window: usize) -> Self {
        self.stats_window = stats_window;
        self
    }

    pub fn with_stats(mut self, enable_stats: bool) -> Self {
        self.enable_stats = enable_stats;
        self
    }

    /// Check every field against its constraint.
    pub fn validate(&self) -> Result<()> {
        self.period.duration()?;
        validate_rate(self.rate)?;
        validate_capacity(self.capacity)?;
        validate_stats_window(self.stats_window)?;
        Ok(())
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file, overridden by
    /// `FASTLIMITER_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading limiter configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        let config: LimiterConfig = builder
            .add_source(
                ::config::Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

pub(crate) fn validate_rate(rate: u64) -> Result<()> {
    if rate == 0 {
        return Err(LimiterError::InvalidConfiguration(
            "The rate must be greater than zero.".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity: u64) -> Result<()> {
    if capacity == 0 {
        return Err(LimiterError::InvalidConfiguration(
            "The capacity must be greater than zero.".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_stats_window(stats_window: usize) -> Result<()> {
    if stats_window == 0 {
        return Err(LimiterError::InvalidConfiguration(
            "The stats window must be greater than zero.".to_string(),
        ));
    }
    Ok(())
}
