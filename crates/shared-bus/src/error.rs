//! Bus and transport errors.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by a [`crate::transport::Transport`] backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// An exclusive queue is owned by another connection
    #[error("resource locked: queue '{0}' is exclusively owned by another connection")]
    ResourceLocked(String),

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),

    /// The broker refused or dropped the connection
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The transport handle was closed
    #[error("transport closed")]
    Closed,

    /// Queue management interface failure
    #[error("management api error: {0}")]
    Management(String),
}

/// Errors surfaced by the message bus connection and the CQRS buses.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No response arrived for a query before its deadline
    #[error("query '{name}' timed out after {timeout:?}")]
    QueryTimeout { name: String, timeout: Duration },

    /// The connection was closed while the operation was in flight
    #[error("message bus connection closed")]
    ConnectionClosed,

    /// A remote operation was requested on a bus without a connection
    #[error("no message bus connection configured")]
    NotConnected,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BusError {
    /// Whether this error is the transport's exclusive-queue lock.
    pub fn is_resource_locked(&self) -> bool {
        matches!(self, BusError::Transport(TransportError::ResourceLocked(_)))
    }
}
