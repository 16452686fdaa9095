//! Protected calls: wrap an async operation with a breaker and a fallback.
//!
//! ```rust,ignore
//! let guard = CircuitGuard::new(
//!     registry.get_or_create("bus_publish_event", CircuitBreakerConfig::new(3, Duration::from_secs(10))),
//!     Fallback::value(None),
//! );
//! let published = guard.call(|| async { transport.publish(...).await.map(Some) }).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::breaker::CircuitBreaker;

/// Value substituted for the operation's result while the circuit rejects calls.
pub struct Fallback<T>(Arc<dyn Fn() -> T + Send + Sync>);

impl<T> Fallback<T> {
    /// Return a clone of `value` on every rejection.
    pub fn value(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self(Arc::new(move || value.clone()))
    }

    /// Compute the fallback on every rejection.
    pub fn with<F>(f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn produce(&self) -> T {
        (self.0)()
    }
}

impl<T: Default + 'static> Default for Fallback<T> {
    fn default() -> Self {
        Self(Arc::new(T::default))
    }
}

impl<T> Clone for Fallback<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fallback(..)")
    }
}

/// A breaker paired with the fallback used when it rejects a call.
#[derive(Debug)]
pub struct CircuitGuard<T> {
    breaker: Arc<CircuitBreaker>,
    fallback: Fallback<T>,
}

impl<T> Clone for CircuitGuard<T> {
    fn clone(&self) -> Self {
        Self {
            breaker: Arc::clone(&self.breaker),
            fallback: self.fallback.clone(),
        }
    }
}

impl<T> CircuitGuard<T> {
    pub fn new(breaker: Arc<CircuitBreaker>, fallback: Fallback<T>) -> Self {
        Self { breaker, fallback }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `operation` if the breaker admits it.
    ///
    /// A rejected call returns the fallback without running the operation.
    /// An `Err` from the operation is recorded as a failure and returned
    /// unchanged; an `Ok` is recorded as a success.
    pub async fn call<E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.breaker.allow_request() {
            warn!(
                breaker = %self.breaker.name(),
                state = %self.breaker.state(),
                "Circuit breaker rejected call, returning fallback"
            );
            return Ok(self.fallback.produce());
        }

        match operation().await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }
}
