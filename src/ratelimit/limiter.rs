//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::config::{self, LimiterConfig, Period};
use crate::error::Result;

use super::bucket::{BucketLimits, Decision, KeyState};
use super::callbacks::{AsyncObserver, CallbackRegistry, Observer};
use super::clock::{Clock, SystemClock};
use super::stats::{KeyStats, StatsReport, StatsSnapshot};

/// Live limiter parameters, shared by every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub limits: BucketLimits,
    /// Stats history length, as a sample count and as seconds
    pub stats_window: usize,
    pub stats_enabled: bool,
}

impl EngineConfig {
    fn from_config(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            limits: BucketLimits {
                rate: config.rate,
                period: config.period.duration()?,
                capacity: config.capacity,
                burst: config.burst,
            },
            stats_window: config.stats_window,
            stats_enabled: config.enable_stats,
        })
    }
}

/// Bucket and statistics for one key, locked together.
#[derive(Debug)]
struct KeyEntry {
    bucket: KeyState,
    stats: KeyStats,
}

impl KeyEntry {
    fn new(config: &EngineConfig, now: Instant) -> Self {
        Self {
            bucket: KeyState::full(&config.limits, now),
            stats: KeyStats::new(config.stats_window),
        }
    }
}

/// A per-key token bucket rate limiter.
///
/// Thread-safe and meant to be shared behind an `Arc`. Each admission holds
/// the parameter read lock plus its key's shard lock; updates and resets hold
/// the parameter write lock across their whole rescale pass, so an update and
/// an admission on the same key never interleave. Observers run after every
/// lock has been released.
pub struct RateLimiter<C: Clock = SystemClock> {
    /// Per-key state indexed by key
    keys: DashMap<String, KeyEntry>,
    settings: RwLock<EngineConfig>,
    callbacks: CallbackRegistry,
    clock: C,
}

impl RateLimiter<SystemClock> {
    /// Create a new rate limiter driven by the system clock.
    pub fn new(config: &LimiterConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a new rate limiter driven by `clock`.
    pub fn with_clock(config: &LimiterConfig, clock: C) -> Result<Self> {
        let settings = EngineConfig::from_config(config)?;
        debug!(
            rate = settings.limits.rate,
            period_secs = settings.limits.period.as_secs(),
            capacity = settings.limits.capacity,
            burst = settings.limits.burst,
            stats_window = settings.stats_window,
            stats_enabled = settings.stats_enabled,
            "Rate limiter initialized"
        );

        Ok(Self {
            keys: DashMap::new(),
            settings: RwLock::new(settings),
            callbacks: CallbackRegistry::new(),
            clock,
        })
    }

    /// Attempt to admit one request for `key`.
    ///
    /// Statistics are recorded and observers notified whatever the outcome.
    pub fn admit(&self, key: &str) -> Decision {
        let now = self.clock.now();

        let decision = {
            let settings = self.settings.read();
            let mut entry = match self.keys.get_mut(key) {
                Some(entry) => entry,
                None => self.keys.entry(key.to_owned()).or_insert_with(|| {
                    debug!(
                        key = %key,
                        tokens = settings.limits.ceiling(),
                        "Creating new token bucket"
                    );
                    KeyEntry::new(&settings, now)
                }),
            };

            let decision = entry.bucket.try_acquire(&settings.limits, now);
            if settings.stats_enabled {
                entry.stats.record(decision.is_allowed(), now);
            }

            trace!(
                key = %key,
                allowed = decision.is_allowed(),
                tokens = entry.bucket.tokens(),
                "Admission decision"
            );
            decision
        };

        if let Decision::Denied { wait } = decision {
            debug!(
                key = %key,
                wait_secs = wait.as_secs_f64(),
                "Rate limit exceeded"
            );
        }

        self.callbacks.notify(decision.is_allowed(), key);
        decision
    }

    /// Time until `key` could be admitted. Zero for unseen keys.
    pub fn wait_time(&self, key: &str) -> Duration {
        let now = self.clock.now();
        let settings = self.settings.read();
        self.keys
            .get(key)
            .map(|entry| entry.bucket.wait_time(&settings.limits, now))
            .unwrap_or(Duration::ZERO)
    }

    /// Statistics for `key`, or [`StatsReport::Disabled`].
    ///
    /// An unseen key reports zero counters and a full bucket.
    pub fn stats(&self, key: &str) -> StatsReport {
        let now = self.clock.now();
        let settings = self.settings.read();
        if !settings.stats_enabled {
            return StatsReport::Disabled;
        }

        let window_start = now.checked_sub(Duration::from_secs(settings.stats_window as u64));
        let since = |at: Option<Instant>| at.map(|at| now.saturating_duration_since(at));

        let snapshot = match self.keys.get(key) {
            Some(entry) => {
                let (window_allowed, window_denied) = entry.stats.window.count_since(window_start);
                let counters = &entry.stats.counters;
                StatsSnapshot {
                    total_allowed: counters.allowed_total,
                    total_denied: counters.denied_total,
                    window_allowed,
                    window_denied,
                    current_tokens: entry.bucket.tokens(),
                    current_capacity: settings.limits.capacity,
                    time_since_last_allowed: since(counters.last_allowed_at),
                    time_since_last_denied: since(counters.last_denied_at),
                }
            }
            None => StatsSnapshot {
                total_allowed: 0,
                total_denied: 0,
                window_allowed: 0,
                window_denied: 0,
                current_tokens: settings.limits.ceiling(),
                current_capacity: settings.limits.capacity,
                time_since_last_allowed: None,
                time_since_last_denied: None,
            },
        };

        StatsReport::Enabled(snapshot)
    }

    /// Refill `key` (or every known key) to full.
    ///
    /// Statistics are cleared too, unless collection is currently disabled.
    pub fn reset(&self, key: Option<&str>) {
        let now = self.clock.now();
        let settings = self.settings.write();
        let reset_entry = |entry: &mut KeyEntry| {
            entry.bucket.refill_to_full(&settings.limits, now);
            if settings.stats_enabled {
                entry.stats.clear();
            }
        };

        match key {
            Some(key) => {
                self.keys
                    .entry(key.to_owned())
                    .and_modify(|entry| reset_entry(entry))
                    .or_insert_with(|| KeyEntry::new(&settings, now));
                debug!(key = %key, "Reset rate limit state");
            }
            None => {
                for mut entry in self.keys.iter_mut() {
                    reset_entry(entry.value_mut());
                }
                debug!(keys = self.keys.len(), "Reset rate limit state for all keys");
            }
        }
    }

    /// Replace the capacity. Stored token counts are left as they are; the
    /// new ceiling applies from the next refill.
    pub fn update_capacity(&self, capacity: u64) -> Result<()> {
        config::validate_capacity(capacity)?;
        let mut settings = self.settings.write();
        settings.limits.capacity = capacity;
        info!(capacity, "Updated capacity");
        Ok(())
    }

    /// Replace the burst, granting it immediately to every known key.
    pub fn update_burst(&self, burst: u64) -> Result<()> {
        let mut settings = self.settings.write();
        let ceiling = settings.limits.capacity.saturating_add(burst) as f64;
        for mut entry in self.keys.iter_mut() {
            entry.bucket.grant(burst, ceiling);
        }
        settings.limits.burst = burst;
        info!(burst, keys = self.keys.len(), "Updated burst");
        Ok(())
    }

    /// Replace the rate.
    ///
    /// Each key's pending refill is settled under the old rate, then its
    /// tokens are scaled by `old_rate / new_rate`.
    pub fn update_rate(&self, rate: u64) -> Result<()> {
        config::validate_rate(rate)?;
        let mut settings = self.settings.write();
        let old = settings.limits;
        let factor = old.rate as f64 / rate as f64;
        self.rescale_all(&old, factor);
        settings.limits.rate = rate;
        info!(old_rate = old.rate, rate, "Updated rate");
        Ok(())
    }

    /// Replace the refill period.
    ///
    /// Same shape as [`update_rate`](Self::update_rate), scaling tokens by
    /// `old_period / new_period`.
    pub fn update_period(&self, seconds: i64, minutes: i64, hours: i64) -> Result<()> {
        let period = Period::new(seconds, minutes, hours).duration()?;
        let mut settings = self.settings.write();
        let old = settings.limits;
        let factor = old.period.as_secs_f64() / period.as_secs_f64();
        self.rescale_all(&old, factor);
        settings.limits.period = period;
        info!(
            old_period_secs = old.period.as_secs(),
            period_secs = period.as_secs(),
            "Updated period"
        );
        Ok(())
    }

    /// Resize every key's stats history, keeping the most recent samples.
    pub fn update_stats_window(&self, stats_window: usize) -> Result<()> {
        config::validate_stats_window(stats_window)?;
        let mut settings = self.settings.write();
        for mut entry in self.keys.iter_mut() {
            entry.stats.window.resize(stats_window);
        }
        settings.stats_window = stats_window;
        info!(stats_window, "Updated stats window");
        Ok(())
    }

    /// Resume statistics collection. Earlier counters are kept.
    pub fn enable_stats(&self) {
        self.settings.write().stats_enabled = true;
        info!("Stats collection enabled");
    }

    /// Pause statistics collection. Counters collected so far are kept.
    pub fn disable_stats(&self) {
        self.settings.write().stats_enabled = false;
        info!("Stats collection disabled");
    }

    /// Register a synchronous observer.
    pub fn on_decision(&self, observer: Arc<dyn Observer>) {
        self.callbacks.register(observer);
    }

    /// Register a closure as an observer.
    pub fn on_decision_fn<F>(&self, f: F)
    where
        F: Fn(bool, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.register_fn(f);
    }

    /// Register an observer that runs on the tokio runtime.
    pub fn on_decision_async(&self, observer: Arc<dyn AsyncObserver>) {
        self.callbacks.register_async(observer);
    }

    /// Drop keys idle for at least `max_idle` whose bucket has refilled to
    /// the ceiling. Returns the number of keys removed.
    ///
    /// Never called internally; hosts decide when to reclaim memory. An
    /// evicted key comes back as a fresh, full bucket with empty statistics.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let settings = self.settings.write();
        let mut evicted = 0;

        self.keys.retain(|_, entry| {
            let idle = now.saturating_duration_since(entry.bucket.last_refill()) >= max_idle;
            let keep = !(idle && entry.bucket.is_full(&settings.limits, now));
            if !keep {
                evicted += 1;
            }
            keep
        });

        if evicted > 0 {
            debug!(evicted, remaining = self.keys.len(), "Evicted idle keys");
        }
        evicted
    }

    /// A copy of the live parameters.
    pub fn config(&self) -> EngineConfig {
        *self.settings.read()
    }

    /// Number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.callbacks.len()
    }

    fn rescale_all(&self, old: &BucketLimits, factor: f64) {
        let now = self.clock.now();
        let ceiling = old.ceiling();
        for mut entry in self.keys.iter_mut() {
            entry.bucket.rescale(old, factor, ceiling, now);
        }
    }
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config())
            .field("keys", &self.key_count())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
