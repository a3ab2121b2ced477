//! Per-key admission statistics.
//!
//! Each key keeps lifetime counters plus a bounded history of recent
//! outcomes. The history is bounded by sample count; queries then filter it
//! by age, so the span it actually covers depends on the request rate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Bounded FIFO of `(timestamp, allowed)` samples.
#[derive(Debug, Clone)]
pub struct StatsWindow {
    samples: VecDeque<(Instant, bool)>,
    capacity: usize,
}

impl StatsWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, at: Instant, allowed: bool) {
        if self.capacity == 0 {
            return;
        }
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, allowed));
    }

    /// Change the capacity, keeping the most recent samples.
    pub fn resize(&mut self, capacity: usize) {
        let excess = self.samples.len().saturating_sub(capacity);
        self.samples.drain(..excess);
        self.capacity = capacity;
    }

    /// Count `(allowed, denied)` samples taken at or after `since`.
    ///
    /// `None` counts every sample.
    pub fn count_since(&self, since: Option<Instant>) -> (u64, u64) {
        self.samples
            .iter()
            .filter(|(at, _)| since.map_or(true, |since| *at >= since))
            .fold((0, 0), |(allowed, denied), (_, ok)| {
                if *ok {
                    (allowed + 1, denied)
                } else {
                    (allowed, denied + 1)
                }
            })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Lifetime counters for one key.
#[derive(Debug, Clone, Default)]
pub struct StatsCounters {
    pub allowed_total: u64,
    pub denied_total: u64,
    pub last_allowed_at: Option<Instant>,
    pub last_denied_at: Option<Instant>,
}

impl StatsCounters {
    pub fn record(&mut self, allowed: bool, at: Instant) {
        if allowed {
            self.allowed_total += 1;
            self.last_allowed_at = Some(at);
        } else {
            self.denied_total += 1;
            self.last_denied_at = Some(at);
        }
    }
}

/// Counters and history for one key.
#[derive(Debug, Clone)]
pub struct KeyStats {
    pub counters: StatsCounters,
    pub window: StatsWindow,
}

impl KeyStats {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            counters: StatsCounters::default(),
            window: StatsWindow::new(window_capacity),
        }
    }

    pub fn record(&mut self, allowed: bool, at: Instant) {
        self.counters.record(allowed, at);
        self.window.push(at, allowed);
    }

    /// Zero the counters and drop the history. Capacity is kept.
    pub fn clear(&mut self) {
        self.counters = StatsCounters::default();
        self.window.clear();
    }
}

/// Point-in-time statistics for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_allowed: u64,
    pub total_denied: u64,
    pub window_allowed: u64,
    pub window_denied: u64,
    /// Stored token count, excluding refill accrued since the last admission
    pub current_tokens: f64,
    pub current_capacity: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub time_since_last_allowed: Option<Duration>,
    #[serde(serialize_with = "serialize_secs")]
    pub time_since_last_denied: Option<Duration>,
}

/// Result of a statistics query.
///
/// Disabled statistics are a normal answer, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatsReport {
    Enabled(StatsSnapshot),
    Disabled,
}

impl StatsReport {
    /// The snapshot, if statistics are enabled.
    pub fn snapshot(&self) -> Option<&StatsSnapshot> {
        match self {
            StatsReport::Enabled(snapshot) => Some(snapshot),
            StatsReport::Disabled => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, StatsReport::Disabled)
    }
}

fn serialize_secs<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let start = Instant::now();
        let mut window = StatsWindow::new(3);
        window.push(start, false);
        window.push(start + Duration::from_secs(1), true);
        window.push(start + Duration::from_secs(2), true);
        window.push(start + Duration::from_secs(3), true);

        assert_eq!(window.len(), 3);
        // The denied sample was the oldest and is gone
        assert_eq!(window.count_since(None), (3, 0));
    }

    #[test]
    fn test_window_filters_by_age() {
        let start = Instant::now();
        let mut window = StatsWindow::new(10);
        for i in 0..5 {
            window.push(start + Duration::from_secs(i), i % 2 == 0);
        }

        let since = start + Duration::from_secs(2);
        assert_eq!(window.count_since(Some(since)), (2, 1));
    }

    #[test]
    fn test_resize_keeps_most_recent() {
        let start = Instant::now();
        let mut window = StatsWindow::new(5);
        for i in 0..5 {
            window.push(start + Duration::from_secs(i), i < 3);
        }

        window.resize(2);
        assert_eq!(window.capacity(), 2);
        assert_eq!(window.count_since(None), (0, 2));

        window.resize(4);
        window.push(start + Duration::from_secs(9), true);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_counters_track_last_outcome() {
        let start = Instant::now();
        let mut stats = KeyStats::new(4);
        stats.record(true, start);
        stats.record(false, start + Duration::from_secs(1));
        stats.record(true, start + Duration::from_secs(2));

        assert_eq!(stats.counters.allowed_total, 2);
        assert_eq!(stats.counters.denied_total, 1);
        assert_eq!(stats.counters.last_allowed_at, Some(start + Duration::from_secs(2)));
        assert_eq!(stats.counters.last_denied_at, Some(start + Duration::from_secs(1)));

        stats.clear();
        assert_eq!(stats.counters.allowed_total, 0);
        assert!(stats.window.is_empty());
        assert_eq!(stats.window.capacity(), 4);
    }

    #[test]
    fn test_report_serializes_with_status_tag() {
        let report = StatsReport::Enabled(StatsSnapshot {
            total_allowed: 3,
            total_denied: 1,
            window_allowed: 3,
            window_denied: 1,
            current_tokens: 2.0,
            current_capacity: 10,
            time_since_last_allowed: Some(Duration::from_millis(1500)),
            time_since_last_denied: None,
        });

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "enabled");
        assert_eq!(json["total_allowed"], 3);
        assert_eq!(json["time_since_last_allowed"], 1.5);
        assert!(json["time_since_last_denied"].is_null());

        let disabled = serde_json::to_value(StatsReport::Disabled).unwrap();
        assert_eq!(disabled, serde_json::json!({ "status": "disabled" }));
    }
}
