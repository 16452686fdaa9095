//! # Service Runtime
//!
//! Wires the shared crates into one service process:
//!
//! ```text
//! RuntimeConfig ─► CircuitBreakerRegistry ─┬─► MessageBusConnection ─► CqrsRegistry
//!                  CounterStoreClient ─────┼─► RateLimiter ─► RateLimitLayer
//!                                          └─► axum Router (/health, /status/*)
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod http;
pub mod runtime;

pub use config::{ConfigError, RuntimeConfig, DEFAULT_HTTP_ADDR};
pub use http::{build_router, AppState};
pub use runtime::{ServiceRuntime, ServiceStatus, ServiceStatusQuery};
