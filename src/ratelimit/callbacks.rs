//! Observers notified after every admission decision.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{trace, warn};

/// How long an async observer may run before it is abandoned.
pub const DEFAULT_ASYNC_OBSERVER_TIMEOUT: Duration = Duration::from_secs(1);

/// Synchronous observer, invoked inline on the admission path.
pub trait Observer: Send + Sync {
    fn on_decision(&self, allowed: bool, key: &str) -> anyhow::Result<()>;
}

/// Observer whose work is deferred to the tokio runtime.
///
/// Invocations are spawned and never awaited by the admission path.
#[async_trait]
pub trait AsyncObserver: Send + Sync {
    async fn on_decision(&self, allowed: bool, key: String) -> anyhow::Result<()>;
}

/// Adapts a closure into an [`Observer`].
struct FnObserver<F>(F);

impl<F> Observer for FnObserver<F>
where
    F: Fn(bool, &str) -> anyhow::Result<()> + Send + Sync,
{
    fn on_decision(&self, allowed: bool, key: &str) -> anyhow::Result<()> {
        (self.0)(allowed, key)
    }
}

#[derive(Clone)]
enum Registered {
    Sync(Arc<dyn Observer>),
    Async(Arc<dyn AsyncObserver>),
}

/// Ordered list of observers.
///
/// No dedup, no priority: observers run in registration order. A failing or
/// panicking observer is logged and skipped.
pub struct CallbackRegistry {
    observers: RwLock<Vec<Registered>>,
    async_timeout: Duration,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::with_async_timeout(DEFAULT_ASYNC_OBSERVER_TIMEOUT)
    }

    pub fn with_async_timeout(async_timeout: Duration) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            async_timeout,
        }
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(Registered::Sync(observer));
    }

    pub fn register_fn<F>(&self, f: F)
    where
        F: Fn(bool, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnObserver(f)));
    }

    pub fn register_async(&self, observer: Arc<dyn AsyncObserver>) {
        self.observers.write().push(Registered::Async(observer));
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Notify every observer of a decision.
    ///
    /// Returns the number of observers that failed synchronously, including
    /// async observers that could not be spawned.
    pub fn notify(&self, allowed: bool, key: &str) -> usize {
        // Snapshot so observers can register further observers without deadlocking
        let observers = self.observers.read().clone();
        let mut errors = 0;

        for observer in observers {
            match observer {
                Registered::Sync(observer) => {
                    let result = catch_unwind(AssertUnwindSafe(|| observer.on_decision(allowed, key)));
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            errors += 1;
                            warn!(key = %key, allowed, error = %e, "Error in rate limiter callback");
                        }
                        Err(_) => {
                            errors += 1;
                            warn!(key = %key, allowed, "Rate limiter callback panicked");
                        }
                    }
                }
                Registered::Async(observer) => {
                    if !self.spawn_async(observer, allowed, key) {
                        errors += 1;
                    }
                }
            }
        }

        errors
    }

    fn spawn_async(&self, observer: Arc<dyn AsyncObserver>, allowed: bool, key: &str) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(key = %key, "No tokio runtime available, skipping async rate limiter callback");
                return false;
            }
        };

        let key = key.to_owned();
        let timeout = self.async_timeout;
        handle.spawn(async move {
            match tokio::time::timeout(timeout, observer.on_decision(allowed, key.clone())).await {
                Ok(Ok(())) => trace!(key = %key, "Async callback completed"),
                Ok(Err(e)) => warn!(key = %key, allowed, error = %e, "Error in async rate limiter callback"),
                Err(_) => warn!(
                    key = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "Async rate limiter callback timed out"
                ),
            }
        });
        true
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("observers", &self.len())
            .field("async_timeout", &self.async_timeout)
            .finish()
    }
}
