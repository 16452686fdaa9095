//! The three limiting algorithms over a [`CounterStoreClient`].
//!
//! Every algorithm returns a [`RateLimitDecision`]. Batched store access goes
//! through [`shared_cache::Pipeline`], which the client runs either atomically
//! or sequentially depending on the backend.

use std::sync::Arc;

use serde::Serialize;
use shared_cache::{CacheError, Clock, CounterStoreClient, Reply};
use thiserror::Error;
use tracing::debug;

use crate::config::{RateLimitConfig, RateLimitStrategy};

/// Token bucket state never lives shorter than this, in seconds.
const MIN_BUCKET_IDLE_SECS: u64 = 600;

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Seconds to wait before retrying, zero when allowed
    pub retry_after: u64,
}

impl RateLimitDecision {
    fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: 0,
        }
    }

    fn deny(retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
        }
    }
}

/// Rate limiting errors
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Store(#[from] CacheError),

    /// Stored token bucket state is not a number
    #[error("corrupt limiter state at '{key}': '{value}'")]
    CorruptState { key: String, value: String },
}

/// Runs limiting algorithms against a shared counter store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: CounterStoreClient,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: CounterStoreClient, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &CounterStoreClient {
        &self.store
    }

    /// Run the algorithm selected by `config.strategy`.
    pub async fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let decision = match config.strategy {
            RateLimitStrategy::FixedWindow => {
                self.fixed_window(key, config.limit, config.window).await?
            }
            RateLimitStrategy::SlidingWindow => {
                self.sliding_window(key, config.limit, config.window, config.bucket_count)
                    .await?
            }
            RateLimitStrategy::TokenBucket => {
                self.token_bucket(key, config.limit, config.window).await?
            }
        };

        debug!(
            key,
            strategy = %config.strategy,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Rate limit checked"
        );
        Ok(decision)
    }

    /// Counter that resets when its key expires. Bursts straddling the
    /// boundary can reach twice the limit.
    pub async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        window: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let mut pipe = self.store.pipeline();
        pipe.incr(key);
        let count = first_int(pipe.execute().await?)?;

        if count == 1 {
            self.store.expire(key, window).await?;
        }

        if count > limit as i64 {
            let ttl = self.store.ttl(key).await?;
            let retry_after = if ttl > 0 { ttl as u64 } else { window };
            return Ok(RateLimitDecision::deny(retry_after));
        }

        Ok(RateLimitDecision::allow(limit - count as u64))
    }

    /// Sum of per-bucket counters over the last `bucket_count` buckets.
    ///
    /// Quantized to whole buckets, so the window slides in steps of
    /// `window / bucket_count` seconds rather than continuously.
    pub async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window: u64,
        bucket_count: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let bucket_count = bucket_count.max(1);
        let bucket_size = (window / bucket_count).max(1);
        let current = self.clock.now().as_secs() / bucket_size;
        let bucket_key = format!("{}:{}", key, current);

        let mut pipe = self.store.pipeline();
        pipe.incr(&bucket_key).expire(&bucket_key, window);
        pipe.execute().await?;

        let first = current.saturating_sub(bucket_count - 1);
        let mut reads = self.store.pipeline();
        for bucket in first..=current {
            reads.get(&format!("{}:{}", key, bucket));
        }

        let mut total: u64 = 0;
        for reply in reads.execute().await? {
            if let Some(value) = reply.into_value()? {
                total += value
                    .parse::<u64>()
                    .map_err(|_| RateLimitError::CorruptState {
                        key: key.to_string(),
                        value,
                    })?;
            }
        }

        if total > limit {
            return Ok(RateLimitDecision::deny(bucket_size));
        }
        Ok(RateLimitDecision::allow(limit - total))
    }

    /// Bucket of `limit` tokens refilled continuously over `window` seconds.
    /// A fresh key starts full.
    ///
    /// A denial waits `ceil((1 - tokens) / rate) + 1` seconds. An empty bucket
    /// (`limit` or `window` of zero) denies every call without touching the
    /// store.
    pub async fn token_bucket(
        &self,
        key: &str,
        limit: u64,
        window: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        if limit == 0 || window == 0 {
            return Ok(RateLimitDecision::deny(window.max(1)));
        }

        let tokens_key = format!("{}:tokens", key);
        let timestamp_key = format!("{}:timestamp", key);
        let now = self.clock.unix_seconds();

        let mut reads = self.store.pipeline();
        reads.get(&tokens_key).get(&timestamp_key);
        let mut replies = reads.execute().await?.into_iter();
        let stored_tokens = next_value(&mut replies)?;
        let stored_timestamp = next_value(&mut replies)?;

        let tokens = parse_float(&tokens_key, stored_tokens)?.unwrap_or(limit as f64);
        let timestamp = parse_float(&timestamp_key, stored_timestamp)?.unwrap_or(now);

        let rate = limit as f64 / window as f64;
        let elapsed = (now - timestamp).max(0.0);
        let mut available = (tokens + elapsed * rate).min(limit as f64);

        if available < 1.0 {
            let wait = ((1.0 - available) / rate).ceil();
            return Ok(RateLimitDecision::deny((wait as u64).saturating_add(1)));
        }

        available -= 1.0;

        let idle = window.saturating_mul(2).max(MIN_BUCKET_IDLE_SECS);
        let mut writes = self.store.pipeline();
        writes
            .set(&tokens_key, available.to_string(), None)
            .set(&timestamp_key, now.to_string(), None)
            .expire(&tokens_key, idle)
            .expire(&timestamp_key, idle);
        writes.execute().await?;

        Ok(RateLimitDecision::allow(available.floor() as u64))
    }
}

fn first_int(replies: Vec<Reply>) -> Result<i64, RateLimitError> {
    let reply = replies
        .into_iter()
        .next()
        .ok_or(CacheError::UnexpectedReply {
            command: "INCR",
            reply: "no reply".to_string(),
        })?;
    Ok(reply.into_int()?)
}

fn next_value(
    replies: &mut impl Iterator<Item = Reply>,
) -> Result<Option<String>, RateLimitError> {
    match replies.next() {
        Some(reply) => Ok(reply.into_value()?),
        None => Err(CacheError::UnexpectedReply {
            command: "GET",
            reply: "missing reply".to_string(),
        }
        .into()),
    }
}

fn parse_float(key: &str, value: Option<String>) -> Result<Option<f64>, RateLimitError> {
    value
        .map(|v| {
            v.parse::<f64>().map_err(|_| RateLimitError::CorruptState {
                key: key.to_string(),
                value: v,
            })
        })
        .transpose()
}
