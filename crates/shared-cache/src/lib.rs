//! # Shared Cache - Counter Store Client
//!
//! A TTL-capable key/value client used by the rate limiter and by any service
//! that needs shared counters.
//!
//! ## Backends
//!
//! | Backend | Batching | Use |
//! |---------|----------|-----|
//! | [`RedisBackend`] | `MULTI`/`EXEC` pipeline | production |
//! | [`MemoryBackend`] | single-lock batch, or none | tests, single-process deployments |
//!
//! ## Pipelines
//!
//! [`CounterStoreClient::pipeline`] queues commands and executes them together,
//! returning replies in submission order. Whether a pipeline runs as one
//! atomic batch or as sequential individual commands is decided once, when the
//! client is constructed ([`BatchMode`]); both paths produce the same replies.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod backend;
pub mod client;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod memory;
pub mod redis_backend;

pub use backend::CounterBackend;
pub use client::{purge_task, BatchMode, CounterStoreClient, Pipeline};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Reply, StoreCommand};
pub use config::{connect, CacheConfig};
pub use error::CacheError;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

/// Default key prefix for rate limit counters.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";
