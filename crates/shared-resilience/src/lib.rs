//! # Shared Resilience - Circuit Breakers
//!
//! Fail-fast protection for calls to unhealthy dependencies (the message broker,
//! the command/query buses, remote services).
//!
//! ## State Machine
//!
//! ```text
//!                 failure_threshold
//!                consecutive failures
//!   ┌──────────┐ ─────────────────► ┌──────────┐
//!   │  CLOSED  │                    │   OPEN   │ ◄──────────┐
//!   │ (normal) │                    │ (reject) │            │
//!   └──────────┘                    └──────────┘            │ any failure
//!        ▲                               │                  │
//!        │ success_threshold             │ recovery_timeout │
//!        │ consecutive successes         ▼                  │
//!        │                         ┌───────────┐            │
//!        └──────────────────────── │ HALF-OPEN │ ───────────┘
//!                                  │  (trial)  │
//!                                  └───────────┘
//! ```
//!
//! The Open → HalfOpen transition is evaluated lazily whenever the state is
//! read; there is no background timer.
//!
//! ## Registry
//!
//! Breakers are looked up by name in a [`CircuitBreakerRegistry`] that the
//! application constructs once and hands to every component. The first
//! lookup for a name creates the breaker with the supplied config; later
//! lookups return the same instance and ignore their config argument.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod breaker;
pub mod guard;
pub mod registry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use guard::{CircuitGuard, Fallback};
pub use registry::CircuitBreakerRegistry;
