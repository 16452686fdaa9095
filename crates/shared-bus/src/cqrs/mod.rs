//! Typed command, query and event buses.
//!
//! Handlers are registered per contract type and dispatched by
//! [`SchemaId`]. When a [`MessageBusConnection`] is supplied the buses also
//! serve the same contracts over the transport.
//!
//! ```text
//! CommandBus::execute ─► command_bus_execute breaker ─► CommandHandler<C>
//! QueryBus::execute   ─► query_bus_execute breaker   ─► QueryHandler<Q>
//! EventBus::publish   ─► connection (event.<name>) then every EventHandler<E>
//! ```

mod command_bus;
mod contract;
mod event_bus;
mod handler;
mod query_bus;

use std::sync::Arc;

use shared_resilience::CircuitBreakerRegistry;

use crate::connection::MessageBusConnection;

pub use command_bus::{CommandBus, COMMAND_BUS_BREAKER};
pub use contract::{
    Command, CommandResult, Contract, Event, MessageKind, Query, QueryResult, SchemaId,
};
pub use event_bus::EventBus;
pub use handler::{
    command_handler_fn, event_handler_fn, query_handler_fn, CommandHandler, EventHandler,
    QueryHandler,
};
pub use query_bus::{QueryBus, QUERY_BUS_BREAKER};

/// The three buses sharing one optional connection and one breaker registry.
#[derive(Clone)]
pub struct CqrsRegistry {
    command_bus: CommandBus,
    query_bus: QueryBus,
    event_bus: EventBus,
    connection: Option<MessageBusConnection>,
}

impl CqrsRegistry {
    pub fn new(
        connection: Option<MessageBusConnection>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            command_bus: CommandBus::new(connection.clone(), Arc::clone(&breakers)),
            query_bus: QueryBus::new(connection.clone(), breakers),
            event_bus: EventBus::new(connection.clone()),
            connection,
        }
    }

    pub fn command_bus(&self) -> &CommandBus {
        &self.command_bus
    }

    pub fn query_bus(&self) -> &QueryBus {
        &self.query_bus
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn connection(&self) -> Option<&MessageBusConnection> {
        self.connection.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Archive {
        quest_id: u64,
    }

    impl Contract for Archive {
        const NAME: &'static str = "ArchiveQuestCommand";
    }

    impl Command for Archive {
        type Output = bool;
    }

    #[tokio::test]
    async fn test_buses_share_breaker_registry() {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let registry = CqrsRegistry::new(None, Arc::clone(&breakers));
        assert!(registry.connection().is_none());

        registry
            .command_bus()
            .register::<Archive>(command_handler_fn(|cmd: Archive| async move {
                Ok(cmd.quest_id > 0)
            }));
        let result = registry.command_bus().execute(Archive { quest_id: 2 }).await;
        assert_eq!(result.data, Some(true));

        assert!(breakers.get(COMMAND_BUS_BREAKER).is_some());
        assert!(breakers.get(QUERY_BUS_BREAKER).is_none());
    }
}
