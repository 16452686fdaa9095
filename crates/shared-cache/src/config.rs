//! Counter store configuration.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::CounterBackend;
use crate::client::{BatchMode, CounterStoreClient};
use crate::clock::Clock;
use crate::error::CacheError;
use crate::memory::MemoryBackend;
use crate::redis_backend::RedisBackend;
use crate::DEFAULT_KEY_PREFIX;

/// Default seconds between expired-key sweeps.
pub const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60;

/// Which backend to build and how the client batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis URL. `None` selects the in-memory backend.
    pub url: Option<String>,
    /// Prefix prepended to every key
    pub prefix: String,
    /// Use atomic batches when the backend supports them
    pub batching: bool,
    /// Seconds between sweeps of expired keys on the memory backend
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            batching: true,
            purge_interval_secs: DEFAULT_PURGE_INTERVAL_SECS,
        }
    }
}

impl CacheConfig {
    /// Read configuration from the environment.
    ///
    /// - `REDIS_URL`: Redis URL (default: unset, in-memory store)
    /// - `CACHE_KEY_PREFIX`: key prefix (default: `ratelimit:`)
    /// - `CACHE_BATCHING`: `false`/`0` forces sequential pipelines
    /// - `CACHE_PURGE_INTERVAL_SECS`: expired-key sweep interval (default: 60)
    pub fn from_env() -> Result<Self, CacheError> {
        let purge_interval_secs = match env::var("CACHE_PURGE_INTERVAL_SECS") {
            Ok(v) => v.parse().map_err(|_| {
                CacheError::Config(format!("invalid CACHE_PURGE_INTERVAL_SECS '{}'", v))
            })?,
            Err(_) => DEFAULT_PURGE_INTERVAL_SECS,
        };
        Ok(Self {
            url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            prefix: env::var("CACHE_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
            batching: env::var("CACHE_BATCHING")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),
            purge_interval_secs,
        })
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.purge_interval_secs == 0 {
            return Err(CacheError::Config(
                "purge_interval_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(url) = &self.url {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(CacheError::Config(format!(
                    "url must use redis:// or rediss://, got '{}'",
                    url
                )));
            }
        }
        Ok(())
    }
}

/// Build a client from configuration. The memory backend uses `clock`.
pub async fn connect(
    config: &CacheConfig,
    clock: Arc<dyn Clock>,
) -> Result<CounterStoreClient, CacheError> {
    config.validate()?;

    let backend: Arc<dyn CounterBackend> = match &config.url {
        Some(url) => Arc::new(RedisBackend::connect(url).await?),
        None => {
            info!(backend = "memory", "No REDIS_URL configured, using in-memory counter store");
            Arc::new(MemoryBackend::with_clock(clock))
        }
    };

    let client = CounterStoreClient::new(backend, config.prefix.clone());
    Ok(if config.batching {
        client
    } else {
        client.with_mode(BatchMode::Sequential)
    })
}
