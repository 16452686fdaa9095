//! In-process counter store with Redis-compatible TTL semantics.
//!
//! - `TTL` returns `-2` for a missing key and `-1` for a key without expiry.
//! - `SET` without a TTL clears any previous expiry; `INCR` keeps it.
//! - Batches run under one lock acquisition, so they are atomic with respect
//!   to other callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::CounterBackend;
use crate::clock::{Clock, SystemClock};
use crate::command::{Reply, StoreCommand};
use crate::error::CacheError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Unix time at which the entry disappears.
    expires_at: Option<Duration>,
}

/// In-memory backend.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    batching: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Batching backend on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Batching backend on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            batching: true,
        }
    }

    /// Report no batch support, forcing clients onto sequential pipelines.
    pub fn without_batching(mut self) -> Self {
        self.batching = false;
        self
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .values()
            .filter(|e| !Self::expired(e, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries held, including expired ones not yet purged.
    pub fn stored_len(&self) -> usize {
        self.entries.lock().len()
    }

    fn expired(entry: &Entry, now: Duration) -> bool {
        entry.expires_at.is_some_and(|at| at <= now)
    }

    fn apply(
        entries: &mut HashMap<String, Entry>,
        now: Duration,
        command: StoreCommand,
    ) -> Result<Reply, CacheError> {
        if entries.get(command.key()).is_some_and(|e| Self::expired(e, now)) {
            entries.remove(command.key());
        }

        match command {
            StoreCommand::Get(key) => Ok(Reply::Value(entries.get(&key).map(|e| e.value.clone()))),
            StoreCommand::Set {
                key,
                value,
                ttl_secs,
            } => {
                let expires_at = ttl_secs.map(|secs| now.saturating_add(Duration::from_secs(secs)));
                entries.insert(key, Entry { value, expires_at });
                Ok(Reply::Ok)
            }
            StoreCommand::Incr(key) => {
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: "0".to_string(),
                    expires_at: None,
                });
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| CacheError::NotAnInteger(key.clone()))?;
                let next = current
                    .checked_add(1)
                    .ok_or_else(|| CacheError::Overflow(key.clone()))?;
                entry.value = next.to_string();
                Ok(Reply::Int(next))
            }
            StoreCommand::Expire { key, secs } => match entries.get_mut(&key) {
                Some(entry) => {
                    entry.expires_at = Some(now.saturating_add(Duration::from_secs(secs)));
                    Ok(Reply::Bool(true))
                }
                None => Ok(Reply::Bool(false)),
            },
            StoreCommand::Ttl(key) => Ok(Reply::Int(match entries.get(&key) {
                None => -2,
                Some(Entry {
                    expires_at: None, ..
                }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => {
                    let remaining = at.saturating_sub(now);
                    // Round up so a live key never reports 0.
                    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                    secs as i64
                }
            })),
            StoreCommand::Delete(key) => Ok(Reply::Bool(entries.remove(&key).is_some())),
            StoreCommand::Exists(key) => Ok(Reply::Bool(entries.contains_key(&key))),
        }
    }
}

#[async_trait]
impl CounterBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_batch(&self) -> bool {
        self.batching
    }

    async fn run(&self, command: StoreCommand) -> Result<Reply, CacheError> {
        let now = self.clock.now();
        Self::apply(&mut self.entries.lock(), now, command)
    }

    async fn run_batch(&self, commands: Vec<StoreCommand>) -> Result<Vec<Reply>, CacheError> {
        if !self.batching {
            return Err(CacheError::BatchUnsupported(self.name()));
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        commands
            .into_iter()
            .map(|command| Self::apply(&mut entries, now, command))
            .collect()
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !Self::expired(e, now));
        before - entries.len()
    }
}
