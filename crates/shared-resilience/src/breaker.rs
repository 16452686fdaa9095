//! Single named circuit breaker.
//!
//! # Configuration
//!
//! - `failure_threshold`: consecutive failures before opening (default: 5)
//! - `recovery_timeout`: time since the last failure before probing (default: 30s)
//! - `success_threshold`: consecutive half-open successes before closing (default: 2)
//! - `half_open_max_requests`: trial calls admitted while half-open (default: 1)

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failure threshold exceeded - requests are rejected immediately
    Open,
    /// Recovery trial - a limited number of requests are let through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures needed to open the circuit
    pub failure_threshold: u32,
    /// Time to wait after the last failure before moving from open to half-open
    pub recovery_timeout: Duration,
    /// Number of consecutive successes needed to close a half-open circuit
    pub success_threshold: u32,
    /// Maximum number of trial requests admitted while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Config with the given failure threshold and recovery timeout, other fields default.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            ..Self::default()
        }
    }
}

/// Mutable breaker state, guarded by a single lock.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    half_open_requests: u32,
    half_open_since: Option<Instant>,
    last_transition: Instant,
    total_allowed: u64,
    total_rejected: u64,
    total_failures: u64,
    total_successes: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            half_open_requests: 0,
            half_open_since: None,
            last_transition: Instant::now(),
            total_allowed: 0,
            total_rejected: 0,
            total_failures: 0,
            total_successes: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_transition = Instant::now();
    }
}

/// A named circuit breaker.
///
/// All methods are synchronous and never block on I/O; the internal lock is
/// only held for the duration of a state update.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the lazy Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)
    }

    /// Decide whether a call may proceed.
    ///
    /// Each `true` returned while half-open consumes one trial slot, so
    /// callers must check exactly once per attempt.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        let allowed = match self.refresh(&mut inner) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    true
                } else if inner
                    .half_open_since
                    .is_some_and(|since| since.elapsed() >= self.config.recovery_timeout)
                {
                    // Trial calls that never reported back are presumed lost.
                    warn!(
                        breaker = %self.name,
                        abandoned = inner.half_open_requests,
                        "Reclaiming stale half-open trial slots"
                    );
                    inner.half_open_requests = 1;
                    inner.half_open_since = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        };

        if allowed {
            inner.total_allowed += 1;
        } else {
            inner.total_rejected += 1;
        }
        allowed
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;

        match self.refresh(&mut inner) {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(
                        breaker = %self.name,
                        successes = inner.success_count,
                        "Circuit breaker transitioned from HALF_OPEN to CLOSED"
                    );
                    inner.transition(CircuitState::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_requests = 0;
                    inner.half_open_since = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.last_failure_time = Some(Instant::now());

        match self.refresh(&mut inner) {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                        "Circuit breaker transitioned from CLOSED to OPEN"
                    );
                    inner.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    breaker = %self.name,
                    "Circuit breaker transitioned from HALF_OPEN back to OPEN"
                );
                inner.transition(CircuitState::Open);
                inner.success_count = 0;
                inner.half_open_since = None;
            }
            // Already open: the fresh timestamp extends the cooldown.
            CircuitState::Open => {}
        }
    }

    /// Snapshot of state and counters.
    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        let state = self.refresh(&mut inner);
        CircuitStats {
            name: self.name.clone(),
            state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_requests: inner.half_open_requests,
            total_allowed: inner.total_allowed,
            total_rejected: inner.total_rejected,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            time_in_state_ms: inner.last_transition.elapsed().as_millis() as u64,
        }
    }

    fn refresh(&self, inner: &mut BreakerState) -> CircuitState {
        if inner.state == CircuitState::Open {
            if let Some(last_failure) = inner.last_failure_time {
                if last_failure.elapsed() >= self.config.recovery_timeout {
                    info!(
                        breaker = %self.name,
                        "Circuit breaker transitioned from OPEN to HALF_OPEN"
                    );
                    inner.transition(CircuitState::HalfOpen);
                    inner.half_open_requests = 0;
                    inner.half_open_since = Some(Instant::now());
                }
            }
        }
        inner.state
    }
}

/// Statistics for a circuit breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_requests: u32,
    pub total_allowed: u64,
    pub total_rejected: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub time_in_state_ms: u64,
}
