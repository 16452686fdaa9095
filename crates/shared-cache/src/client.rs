//! Prefixing client and pipelines over a [`CounterBackend`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::backend::CounterBackend;
use crate::command::{Reply, StoreCommand};
use crate::error::CacheError;

/// How a [`Pipeline`] executes its queued commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// One backend batch, atomic where the backend supports it
    Atomic,
    /// Each command issued on its own, in order
    Sequential,
}

/// Counter store client. Cheap to clone.
#[derive(Clone)]
pub struct CounterStoreClient {
    backend: Arc<dyn CounterBackend>,
    prefix: String,
    mode: BatchMode,
}

impl fmt::Debug for CounterStoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterStoreClient")
            .field("backend", &self.backend.name())
            .field("prefix", &self.prefix)
            .field("mode", &self.mode)
            .finish()
    }
}

impl CounterStoreClient {
    /// Build a client. The batch mode is fixed here from the backend's
    /// capabilities and never checked again.
    pub fn new(backend: Arc<dyn CounterBackend>, prefix: impl Into<String>) -> Self {
        let mode = if backend.supports_batch() {
            BatchMode::Atomic
        } else {
            BatchMode::Sequential
        };
        debug!(backend = backend.name(), ?mode, "Counter store client created");
        Self {
            backend,
            prefix: prefix.into(),
            mode,
        }
    }

    /// Force a batch mode. `Atomic` on a backend without batching falls
    /// back to `Sequential`.
    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.mode = if self.backend.supports_batch() {
            mode
        } else {
            BatchMode::Sequential
        };
        self
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.backend
            .run(StoreCommand::Get(self.key(key)))
            .await?
            .into_value()
    }

    pub async fn set(
        &self,
        key: &str,
        value: impl Into<String>,
        ttl_secs: Option<u64>,
    ) -> Result<(), CacheError> {
        self.backend
            .run(StoreCommand::Set {
                key: self.key(key),
                value: value.into(),
                ttl_secs,
            })
            .await?;
        Ok(())
    }

    /// Atomic increment. A missing key counts from zero.
    pub async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.backend
            .run(StoreCommand::Incr(self.key(key)))
            .await?
            .into_int()
    }

    pub async fn expire(&self, key: &str, secs: u64) -> Result<bool, CacheError> {
        self.backend
            .run(StoreCommand::Expire {
                key: self.key(key),
                secs,
            })
            .await?
            .into_bool()
    }

    /// Remaining TTL in seconds: `-2` missing, `-1` no expiry.
    pub async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.backend
            .run(StoreCommand::Ttl(self.key(key)))
            .await?
            .into_int()
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.backend
            .run(StoreCommand::Delete(self.key(key)))
            .await?
            .into_bool()
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.backend
            .run(StoreCommand::Exists(self.key(key)))
            .await?
            .into_bool()
    }

    /// Start an empty pipeline.
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            client: self,
            commands: Vec::new(),
        }
    }

    /// Drop expired keys held by the backend.
    pub fn purge_expired(&self) -> usize {
        self.backend.purge_expired()
    }
}

/// Background sweep of expired keys on backends that keep them until read.
pub async fn purge_task(client: CounterStoreClient, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let removed = client.purge_expired();
        if removed > 0 {
            debug!(removed = removed, backend = client.backend_name(), "Purged expired keys");
        }
    }
}

/// Queued commands executed together by [`Pipeline::execute`].
#[must_use = "a pipeline does nothing until executed"]
pub struct Pipeline<'a> {
    client: &'a CounterStoreClient,
    commands: Vec<StoreCommand>,
}

impl Pipeline<'_> {
    pub fn get(&mut self, key: &str) -> &mut Self {
        let key = self.client.key(key);
        self.commands.push(StoreCommand::Get(key));
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>, ttl_secs: Option<u64>) -> &mut Self {
        let key = self.client.key(key);
        self.commands.push(StoreCommand::Set {
            key,
            value: value.into(),
            ttl_secs,
        });
        self
    }

    pub fn incr(&mut self, key: &str) -> &mut Self {
        let key = self.client.key(key);
        self.commands.push(StoreCommand::Incr(key));
        self
    }

    pub fn expire(&mut self, key: &str, secs: u64) -> &mut Self {
        let key = self.client.key(key);
        self.commands.push(StoreCommand::Expire { key, secs });
        self
    }

    pub fn ttl(&mut self, key: &str) -> &mut Self {
        let key = self.client.key(key);
        self.commands.push(StoreCommand::Ttl(key));
        self
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        let key = self.client.key(key);
        self.commands.push(StoreCommand::Delete(key));
        self
    }

    pub fn exists(&mut self, key: &str) -> &mut Self {
        let key = self.client.key(key);
        self.commands.push(StoreCommand::Exists(key));
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run every queued command, replies in submission order.
    pub async fn execute(&mut self) -> Result<Vec<Reply>, CacheError> {
        let commands = std::mem::take(&mut self.commands);
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        match self.client.mode {
            BatchMode::Atomic => self.client.backend.run_batch(commands).await,
            BatchMode::Sequential => {
                let mut replies = Vec::with_capacity(commands.len());
                for command in commands {
                    replies.push(self.client.backend.run(command).await?);
                }
                Ok(replies)
            }
        }
    }
}
