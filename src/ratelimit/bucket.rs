//! Token bucket state for a single key.

use std::time::{Duration, Instant};

use crate::error::{LimiterError, Result};

/// The parameters every bucket is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLimits {
    /// Tokens granted per `period`
    pub rate: u64,
    /// Length of the refill period
    pub period: Duration,
    /// Baseline bucket size
    pub capacity: u64,
    /// Extra tokens allowed on top of `capacity`
    pub burst: u64,
}

impl BucketLimits {
    /// The most tokens a bucket can hold.
    pub fn ceiling(&self) -> f64 {
        self.capacity.saturating_add(self.burst) as f64
    }

    /// Tokens granted per second.
    pub fn refill_rate(&self) -> f64 {
        let period = self.period.as_secs_f64();
        if period <= 0.0 {
            return 0.0;
        }
        self.rate as f64 / period
    }

    /// Time needed to accumulate `tokens` at the current refill rate.
    fn time_to_refill(&self, tokens: f64) -> Duration {
        let refill_rate = self.refill_rate();
        if refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(tokens / refill_rate).unwrap_or(Duration::MAX)
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A token was consumed.
    Allowed,
    /// No token was available. `wait` is the time until one will be.
    Denied { wait: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Time the caller should wait before retrying. Zero when allowed.
    pub fn wait(&self) -> Duration {
        match self {
            Decision::Allowed => Duration::ZERO,
            Decision::Denied { wait } => *wait,
        }
    }

    /// Convert a denial into [`LimiterError::RateLimited`].
    ///
    /// For hosts that surface "too many requests" as an error.
    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allowed => Ok(()),
            Decision::Denied { wait } => Err(LimiterError::RateLimited { wait }),
        }
    }
}

/// Token count and refill timestamp for one key.
///
/// Refill is lazy: tokens are only computed when the bucket is touched, there
/// is no background ticking.
#[derive(Debug, Clone)]
pub struct KeyState {
    tokens: f64,
    last_refill: Instant,
}

impl KeyState {
    /// A bucket holding `capacity + burst` tokens.
    pub fn full(limits: &BucketLimits, now: Instant) -> Self {
        Self {
            tokens: limits.ceiling(),
            last_refill: now,
        }
    }

    /// Stored token count, without any pending refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Tokens available at `now`, including the refill accrued since the
    /// last stamp. Does not mutate the bucket.
    pub fn available(&self, limits: &BucketLimits, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let refilled = self.tokens + elapsed * limits.refill_rate();
        refilled.min(limits.ceiling())
    }

    /// Try to consume one token.
    ///
    /// A denial leaves the bucket untouched; the next attempt recomputes from
    /// the same stamp, which accounts for the partial refill.
    pub fn try_acquire(&mut self, limits: &BucketLimits, now: Instant) -> Decision {
        if limits.rate == 0 {
            return Decision::Denied {
                wait: Duration::MAX,
            };
        }

        let current = self.available(limits, now);
        if current >= 1.0 {
            self.tokens = current - 1.0;
            self.last_refill = now;
            Decision::Allowed
        } else {
            Decision::Denied {
                wait: limits.time_to_refill(1.0 - current),
            }
        }
    }

    /// Time until one token is available. Zero if one already is.
    pub fn wait_time(&self, limits: &BucketLimits, now: Instant) -> Duration {
        if limits.rate == 0 {
            return Duration::MAX;
        }
        let current = self.available(limits, now);
        if current >= 1.0 {
            Duration::ZERO
        } else {
            limits.time_to_refill(1.0 - current)
        }
    }

    /// Fold the pending refill under `limits` into the stored count and
    /// multiply it by `factor`, clamped to `ceiling`. Restamps at `now`.
    pub fn rescale(&mut self, limits: &BucketLimits, factor: f64, ceiling: f64, now: Instant) {
        let settled = self.available(limits, now);
        self.tokens = (settled * factor).min(ceiling);
        self.last_refill = now;
    }

    /// Grant `burst` extra tokens, clamped to `ceiling`.
    pub fn grant(&mut self, burst: u64, ceiling: f64) {
        self.tokens = (self.tokens + burst as f64).min(ceiling);
    }

    /// Refill to the ceiling and restamp.
    pub fn refill_to_full(&mut self, limits: &BucketLimits, now: Instant) {
        self.tokens = limits.ceiling();
        self.last_refill = now;
    }

    /// Whether the bucket would be at its ceiling at `now`.
    pub fn is_full(&self, limits: &BucketLimits, now: Instant) -> bool {
        self.available(limits, now) >= limits.ceiling()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rate: u64, period_secs: u64, capacity: u64, burst: u64) -> BucketLimits {
        BucketLimits {
            rate,
            period: Duration::from_secs(period_secs),
            capacity,
            burst,
        }
    }

    #[test]
    fn test_refill_rate_and_ceiling() {
        let l = limits(10, 60, 10, 5);
        assert_eq!(l.ceiling(), 15.0);
        assert!((l.refill_rate() - 10.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_full_bucket_admits_capacity_plus_burst() {
        let l = limits(10, 60, 10, 5);
        let now = Instant::now();
        let mut bucket = KeyState::full(&l, now);

        for _ in 0..15 {
            assert_eq!(bucket.try_acquire(&l, now), Decision::Allowed);
        }

        let decision = bucket.try_acquire(&l, now);
        assert!(!decision.is_allowed());
        // One token takes period / rate = 6s to accrue
        assert!((decision.wait().as_secs_f64() - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_denial_does_not_touch_bucket() {
        let l = limits(1, 10, 1, 0);
        let now = Instant::now();
        let mut bucket = KeyState::full(&l, now);
        assert!(bucket.try_acquire(&l, now).is_allowed());

        let later = now + Duration::from_secs(4);
        assert!(!bucket.try_acquire(&l, later).is_allowed());
        assert_eq!(bucket.tokens(), 0.0);
        assert_eq!(bucket.last_refill(), now);

        // Partial refill from the first denial is still counted
        let ready = now + Duration::from_millis(10_001);
        assert!(bucket.try_acquire(&l, ready).is_allowed());
    }

    #[test]
    fn test_zero_rate_always_denies() {
        let l = limits(0, 60, 10, 5);
        let now = Instant::now();
        let mut bucket = KeyState::full(&l, now);

        let decision = bucket.try_acquire(&l, now + Duration::from_secs(3600));
        assert_eq!(
            decision,
            Decision::Denied {
                wait: Duration::MAX
            }
        );
        assert_eq!(bucket.tokens(), 15.0);
        assert_eq!(bucket.wait_time(&l, now), Duration::MAX);
    }

    #[test]
    fn test_refill_is_clamped_to_ceiling() {
        let l = limits(100, 1, 3, 2);
        let now = Instant::now();
        let mut bucket = KeyState::full(&l, now);
        bucket.try_acquire(&l, now);

        let later = now + Duration::from_secs(60);
        assert_eq!(bucket.available(&l, later), 5.0);
        assert!(bucket.is_full(&l, later));
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let l = limits(10, 1, 1, 0);
        let now = Instant::now();
        let later = now + Duration::from_secs(5);
        let mut bucket = KeyState::full(&l, later);
        assert!(bucket.try_acquire(&l, later).is_allowed());

        assert_eq!(bucket.available(&l, now), 0.0);
        assert!(!bucket.try_acquire(&l, now).is_allowed());
    }

    #[test]
    fn test_wait_time_is_pure() {
        let l = limits(2, 1, 1, 0);
        let now = Instant::now();
        let mut bucket = KeyState::full(&l, now);
        bucket.try_acquire(&l, now);

        let wait = bucket.wait_time(&l, now);
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-9);
        assert_eq!(bucket.tokens(), 0.0);
        assert_eq!(bucket.wait_time(&l, now + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_rescale_applies_pending_refill_first() {
        let l = limits(10, 10, 10, 0);
        let now = Instant::now();
        let mut bucket = KeyState::full(&l, now);
        for _ in 0..10 {
            bucket.try_acquire(&l, now);
        }

        // 2s at 1 token/s accrues 2 tokens, then halve them
        let later = now + Duration::from_secs(2);
        bucket.rescale(&l, 0.5, l.ceiling(), later);
        assert!((bucket.tokens() - 1.0).abs() < 1e-9);
        assert_eq!(bucket.last_refill(), later);
    }

    #[test]
    fn test_grant_is_clamped() {
        let l = limits(1, 1, 10, 0);
        let now = Instant::now();
        let mut bucket = KeyState::full(&l, now);
        bucket.grant(5, 12.0);
        assert_eq!(bucket.tokens(), 12.0);
    }

    #[test]
    fn test_decision_into_result() {
        assert!(Decision::Allowed.into_result().is_ok());

        let denied = Decision::Denied {
            wait: Duration::from_secs(2),
        };
        match denied.into_result() {
            Err(LimiterError::RateLimited { wait }) => assert_eq!(wait, Duration::from_secs(2)),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
