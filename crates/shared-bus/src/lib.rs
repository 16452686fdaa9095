//! # Shared Bus - Message Bus for Inter-Service Communication
//!
//! Command, event and query (RPC) messaging between services over a shared
//! topic exchange, plus typed CQRS buses on top.
//!
//! ## Messaging Patterns
//!
//! ```text
//! ┌──────────────┐  command.<svc>.<name>  ┌──────────────┐
//! │  Service A   │ ─────────────────────► │  Service B   │  one handler
//! │              │  query.<svc>.<name>    │              │
//! │              │ ─────────────────────► │              │
//! │              │ ◄───────────────────── │              │  response to
//! └──────────────┘   <a>_callback_<uuid>  └──────────────┘  reply_to
//!        │
//!        │ event.<name>                   every subscribed service
//!        └──────────────────────────────► runs its handlers in order
//! ```
//!
//! ## Guarantees
//!
//! - **Bounded queries:** every pending query has a deadline; expired
//!   entries are evicted and the caller gets [`BusError::QueryTimeout`]
//! - **Breakers:** publishing is guarded by the `bus_*` circuit breakers; an
//!   open breaker returns `Ok(None)` without touching the transport
//! - **Dead-lettering:** deliveries whose handler fails are rejected
//!   without requeue
//!
//! The [`transport`] module is the broker seam. [`amqp::AmqpConnector`]
//! talks to RabbitMQ; [`memory::InMemoryBroker`] runs everything in-process
//! for tests and single-process deployments.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod amqp;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod cqrs;
pub mod error;
pub mod memory;
pub mod message;
pub mod pending;
pub mod topic;
pub mod transport;

// Re-export main types
pub use amqp::{AmqpConnector, AmqpTransport, RabbitMqAdmin};
pub use config::{BrokerEndpoint, ConfigError, MessageBusConfig, DEFAULT_EXCHANGE};
pub use connection::{
    MessageBusConnection, PUBLISH_EVENT_BREAKER, SEND_COMMAND_BREAKER, SEND_QUERY_BREAKER,
};
pub use correlation::CorrelationId;
pub use cqrs::{CommandBus, CqrsRegistry, EventBus, QueryBus};
pub use error::{BusError, TransportError};
pub use memory::{BrokerStats, InMemoryBroker, MemoryTransport};
pub use message::{Message, MessageType};
pub use pending::{PendingQueries, PendingSnapshot};
pub use transport::{
    Connector, Consumer, Delivery, Envelope, QueueAdmin, QueueOptions, Transport,
};
