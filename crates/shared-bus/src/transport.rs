//! Transport seam: a durable topic-exchange broker.
//!
//! The connection only relies on what every AMQP-style broker offers:
//! topic exchanges, named queues (durable or exclusive/auto-delete),
//! wildcard bindings, direct-to-queue sends and explicit ack/reject.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survives broker restarts
    pub durable: bool,
    /// Owned by the declaring connection; others get `ResourceLocked`
    pub exclusive: bool,
    /// Deleted once its last consumer goes away
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Shared, long-lived queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Private reply queue for one connection.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A message body plus its transport-level properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            routing_key: String::new(),
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message received from a queue. Must be acked or rejected.
pub struct Delivery {
    pub envelope: Envelope,
    acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: Box<dyn Acker>) -> Self {
        Self { envelope, acker }
    }

    /// Remove the message from the queue.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Return the message to the queue, or dead-letter it.
    pub async fn reject(self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(requeue).await
    }
}

/// Stream of deliveries from one queue.
#[async_trait]
pub trait Consumer: Send {
    /// Next delivery, or `None` once the queue or connection is gone.
    async fn next(&mut self) -> Option<Delivery>;
}

/// One open broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<(), TransportError>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), TransportError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), TransportError>;

    /// Publish through an exchange; unroutable messages are dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), TransportError>;

    /// Deliver straight to a named queue.
    async fn send_to_queue(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError>;

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Close the connection, ending its consumers and dropping exclusive queues.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Broker management interface used to clean up stale queues.
#[async_trait]
pub trait QueueAdmin: Send + Sync {
    async fn list_queues(&self) -> Result<Vec<String>, TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError>;
}
