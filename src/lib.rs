//! fastlimiter - In-process token bucket rate limiting
//!
//! This crate implements a per-key token bucket rate limiter with burst
//! allowance, live statistics, and parameters that can be changed while the
//! limiter is serving traffic. Hosts (HTTP middleware, RPC interceptors, ...)
//! derive a key per request and call into [`ratelimit::AdmissionControl`].

pub mod config;
pub mod error;
pub mod ratelimit;

pub use crate::config::{LimiterConfig, Period};
pub use crate::error::{LimiterError, Result};
pub use crate::ratelimit::{AdmissionControl, Decision, RateLimiter, StatsReport, StatsSnapshot};
