//! # Shared Rate Limit
//!
//! Per-client, per-endpoint request limiting backed by the shared counter
//! store, so every replica of a service enforces one budget.
//!
//! | Strategy | State per key | Burst behavior |
//! |----------|---------------|----------------|
//! | `fixed_window` | one counter | up to 2x limit across a window boundary |
//! | `sliding_window` | `bucket_count` counters | quantized to one bucket |
//! | `token_bucket` | tokens + timestamp | at most `limit`, then `limit / window` per second |
//!
//! ## Usage
//!
//! ```rust,ignore
//! let limiter = RateLimiter::new(store, Arc::new(SystemClock));
//! let app = Router::new()
//!     .route("/quests", get(list_quests))
//!     .layer(RateLimitLayer::new(limiter, MiddlewareConfig::from_env()?)?);
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod algorithms;
pub mod config;
pub mod middleware;

pub use algorithms::{RateLimitDecision, RateLimitError, RateLimiter};
pub use config::{ConfigError, EndpointLimit, MiddlewareConfig, RateLimitConfig, RateLimitStrategy};
pub use middleware::{
    default_client_id, limiter_key, ClientIdExtractor, RateLimitLayer, RateLimitService,
    RateLimitState,
};
