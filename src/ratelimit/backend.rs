//! The interface a hosting request-handling layer uses.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

use super::bucket::Decision;
use super::callbacks::Observer;
use super::clock::Clock;
use super::limiter::RateLimiter;
use super::stats::StatsReport;

/// Admission control as seen by a host.
///
/// The host derives the key from its own request context, turns a denial
/// into its "too many requests" response, and surfaces configuration errors
/// on its own terms.
pub trait AdmissionControl: Send + Sync {
    /// Attempt to admit one request. Never blocks.
    fn admit(&self, key: &str) -> Decision;

    fn wait_time(&self, key: &str) -> Duration;

    fn stats(&self, key: &str) -> StatsReport;

    /// Reset one key, or every key when `None`.
    fn reset(&self, key: Option<&str>);

    fn update_rate(&self, rate: u64) -> Result<()>;

    fn update_capacity(&self, capacity: u64) -> Result<()>;

    fn update_burst(&self, burst: u64) -> Result<()>;

    fn update_period(&self, seconds: i64, minutes: i64, hours: i64) -> Result<()>;

    fn update_stats_window(&self, stats_window: usize) -> Result<()>;

    fn enable_stats(&self);

    fn disable_stats(&self);

    fn on_decision(&self, observer: Arc<dyn Observer>);

    /// Admit, turning a denial into [`LimiterError::RateLimited`](crate::error::LimiterError::RateLimited).
    fn check(&self, key: &str) -> Result<()> {
        self.admit(key).into_result()
    }
}

impl<C: Clock> AdmissionControl for RateLimiter<C> {
    fn admit(&self, key: &str) -> Decision {
        RateLimiter::admit(self, key)
    }

    fn wait_time(&self, key: &str) -> Duration {
        RateLimiter::wait_time(self, key)
    }

    fn stats(&self, key: &str) -> StatsReport {
        RateLimiter::stats(self, key)
    }

    fn reset(&self, key: Option<&str>) {
        RateLimiter::reset(self, key)
    }

    fn update_rate(&self, rate: u64) -> Result<()> {
        RateLimiter::update_rate(self, rate)
    }

    fn update_capacity(&self, capacity: u64) -> Result<()> {
        RateLimiter::update_capacity(self, capacity)
    }

    fn update_burst(&self, burst: u64) -> Result<()> {
        RateLimiter::update_burst(self, burst)
    }

    fn update_period(&self, seconds: i64, minutes: i64, hours: i64) -> Result<()> {
        RateLimiter::update_period(self, seconds, minutes, hours)
    }

    fn update_stats_window(&self, stats_window: usize) -> Result<()> {
        RateLimiter::update_stats_window(self, stats_window)
    }

    fn enable_stats(&self) {
        RateLimiter::enable_stats(self)
    }

    fn disable_stats(&self) {
        RateLimiter::disable_stats(self)
    }

    fn on_decision(&self, observer: Arc<dyn Observer>) {
        RateLimiter::on_decision(self, observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimiterConfig, Period};
    use crate::error::LimiterError;
    use crate::ratelimit::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_backend() -> Arc<dyn AdmissionControl> {
        let config = LimiterConfig::new(10, Period::seconds(60))
            .with_capacity(10)
            .with_burst(5)
            .with_stats_window(20);
        Arc::new(RateLimiter::with_clock(&config, ManualClock::new()).unwrap())
    }

    /// What a host middleware does with a request from `addr`.
    fn handle_request(limiter: &dyn AdmissionControl, addr: &str) -> (u16, String) {
        match limiter.check(addr) {
            Ok(()) => (200, "Test endpoint".to_string()),
            Err(e) => (429, e.to_string()),
        }
    }

    #[test]
    fn test_host_translates_denial() {
        let limiter = create_backend();

        for _ in 0..15 {
            assert_eq!(handle_request(limiter.as_ref(), "127.0.0.1").0, 200);
        }

        let (status, detail) = handle_request(limiter.as_ref(), "127.0.0.1");
        assert_eq!(status, 429);
        assert_eq!(detail, "Rate limit exceeded. Try again in 6.00 seconds.");

        // Another client is unaffected
        assert_eq!(handle_request(limiter.as_ref(), "127.0.0.2").0, 200);
    }

    #[test]
    fn test_invalid_update_surfaces_as_error() {
        let limiter = create_backend();
        assert!(matches!(
            limiter.update_rate(0),
            Err(LimiterError::InvalidConfiguration(_))
        ));
        assert!(limiter.update_period(0, 0, 1).is_ok());
    }

    #[test]
    fn test_observer_through_boundary() {
        struct Counter(AtomicUsize);

        impl Observer for Counter {
            fn on_decision(&self, _allowed: bool, _key: &str) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let limiter = create_backend();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        limiter.on_decision(counter.clone());

        for _ in 0..16 {
            limiter.admit("client");
        }
        limiter.reset(None);
        limiter.admit("client");

        assert_eq!(counter.0.load(Ordering::SeqCst), 17);
        assert_eq!(
            limiter.stats("client").snapshot().map(|s| s.total_allowed),
            Some(1)
        );

        limiter.disable_stats();
        assert!(limiter.stats("client").is_disabled());
        limiter.enable_stats();
        assert!(limiter.update_stats_window(5).is_ok());
    }
}
