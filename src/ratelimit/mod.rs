//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod callbacks;
mod clock;
mod limiter;
mod stats;

pub use backend::AdmissionControl;
pub use bucket::{BucketLimits, Decision, KeyState};
pub use callbacks::{AsyncObserver, CallbackRegistry, Observer, DEFAULT_ASYNC_OBSERVER_TIMEOUT};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{EngineConfig, RateLimiter};
pub use stats::{KeyStats, StatsCounters, StatsReport, StatsSnapshot, StatsWindow};
