//! Breaker registry keyed by name.
//!
//! Constructed once at startup and shared as `Arc<CircuitBreakerRegistry>`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};
use crate::guard::{CircuitGuard, Fallback};

/// Registry of circuit breakers for different operations.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker for `name`, creating it with `config` on first use.
    ///
    /// `config` is ignored when the breaker already exists.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(breaker = name, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(name, config))
        }))
    }

    /// Build a guard around the named breaker.
    pub fn guard<T>(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
        fallback: Fallback<T>,
    ) -> CircuitGuard<T> {
        CircuitGuard::new(self.get_or_create(name, config), fallback)
    }

    /// Look up an existing breaker.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Drop the breaker for `name`; the next lookup creates a fresh one.
    ///
    /// Holders of the old `Arc` keep the old instance.
    pub fn reset(&self, name: &str) -> bool {
        let removed = self.breakers.write().remove(name).is_some();
        if removed {
            info!(breaker = name, "Circuit breaker reset");
        }
        removed
    }

    /// Statistics for every registered breaker, sorted by name.
    pub fn stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<_> = self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}
