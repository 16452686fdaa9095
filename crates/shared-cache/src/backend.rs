//! Backend seam for the counter store.

use async_trait::async_trait;

use crate::command::{Reply, StoreCommand};
use crate::error::CacheError;

/// A key/value store able to run [`StoreCommand`]s.
///
/// `incr` must be atomic at the store level; read-modify-write is not
/// acceptable because concurrent requests from one client share a key.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether [`CounterBackend::run_batch`] executes commands as one unit.
    fn supports_batch(&self) -> bool;

    /// Run a single command.
    async fn run(&self, command: StoreCommand) -> Result<Reply, CacheError>;

    /// Run commands as one batch, replies in submission order.
    async fn run_batch(&self, commands: Vec<StoreCommand>) -> Result<Vec<Reply>, CacheError>;

    /// Drop expired keys the store does not evict by itself. Returns how
    /// many were removed. Redis expires keys on its own.
    fn purge_expired(&self) -> usize {
        0
    }
}
