//! Command bus: one handler per command, executed behind a circuit breaker.

use std::any::Any;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use shared_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, Fallback};
use tracing::{debug, error, warn};

use super::contract::{Command, CommandResult, SchemaId};
use super::handler::CommandHandler;
use crate::connection::{self, MessageBusConnection};
use crate::error::BusError;

/// Breaker guarding [`CommandBus::execute`].
pub const COMMAND_BUS_BREAKER: &str = "command_bus_execute";

/// Type-erased `Arc<dyn CommandHandler<C>>`
type ErasedHandler = Arc<dyn Any + Send + Sync>;

struct CommandBusInner {
    handlers: RwLock<HashMap<SchemaId, ErasedHandler>>,
    connection: Option<MessageBusConnection>,
    breakers: Arc<CircuitBreakerRegistry>,
}

/// Routes commands to their handlers. Cheap to clone.
#[derive(Clone)]
pub struct CommandBus {
    inner: Arc<CommandBusInner>,
}

impl CommandBus {
    pub fn new(
        connection: Option<MessageBusConnection>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(CommandBusInner {
                handlers: RwLock::new(HashMap::new()),
                connection,
                breakers,
            }),
        }
    }

    /// Register the handler for `C`, replacing any previous one.
    ///
    /// With a connection, commands named `C::NAME` arriving over the
    /// transport are deserialized and executed through this bus.
    pub fn register<C: Command>(&self, handler: Arc<dyn CommandHandler<C>>) {
        let id = SchemaId::command::<C>();
        let erased: ErasedHandler = Arc::new(handler);
        if self.inner.handlers.write().insert(id, erased).is_some() {
            warn!(schema = %id, "Overwriting existing command handler");
        }

        if let Some(connection) = &self.inner.connection {
            let bus = Arc::downgrade(&self.inner);
            connection.register_command(
                C::NAME,
                connection::command_handler(move |data| {
                    let bus = Weak::clone(&bus);
                    async move {
                        let bus = bus
                            .upgrade()
                            .map(|inner| CommandBus { inner })
                            .ok_or_else(|| anyhow::anyhow!("command bus dropped"))?;
                        let command: C = serde_json::from_value(data)?;
                        let result = bus.execute(command).await;
                        if result.success {
                            Ok(())
                        } else {
                            Err(anyhow::anyhow!(
                                "{}: {}",
                                result.message.unwrap_or_default(),
                                result.errors.join("; ")
                            ))
                        }
                    }
                }),
            );
        }
        debug!(schema = %id, "Command handler registered");
    }

    pub fn has_handler<C: Command>(&self) -> bool {
        self.handler::<C>().is_some()
    }

    fn handler<C: Command>(&self) -> Option<Arc<dyn CommandHandler<C>>> {
        let handlers = self.inner.handlers.read();
        handlers
            .get(&SchemaId::command::<C>())?
            .downcast_ref::<Arc<dyn CommandHandler<C>>>()
            .cloned()
    }

    /// Execute a command locally.
    ///
    /// Never fails: a missing handler, a handler error or an open breaker all
    /// produce a failure result. Handler errors become failure results inside
    /// the guarded call, so they never count against the shared breaker.
    pub async fn execute<C: Command>(&self, command: C) -> CommandResult<C::Output> {
        let handler = self.handler::<C>();
        let guard = self.inner.breakers.guard(
            COMMAND_BUS_BREAKER,
            CircuitBreakerConfig::new(5, Duration::from_secs(30)),
            Fallback::with(|| {
                CommandResult::failure(
                    "Service temporarily unavailable",
                    vec![format!("circuit '{}' is open", COMMAND_BUS_BREAKER)],
                )
            }),
        );

        let outcome = guard
            .call(|| async move {
                let result = match handler {
                    Some(handler) => match handler.handle(command).await {
                        Ok(data) => CommandResult::ok(data),
                        Err(e) => {
                            error!(command = C::NAME, error = %e, "Command handler failed");
                            CommandResult::failure(
                                format!("Command {} failed", C::NAME),
                                vec![e.to_string()],
                            )
                        }
                    },
                    None => {
                        warn!(command = C::NAME, "No handler registered for command");
                        CommandResult::failure(
                            format!("No handler registered for command {}", C::NAME),
                            Vec::new(),
                        )
                    }
                };
                Ok::<_, Infallible>(result)
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(never) => match never {},
        }
    }

    /// Send a command to another service over the connection.
    pub async fn send_remote<C: Command>(
        &self,
        service: &str,
        command: &C,
    ) -> Result<Option<()>, BusError> {
        let connection = self.inner.connection.as_ref().ok_or(BusError::NotConnected)?;
        let data = serde_json::to_value(command)?;
        connection.send_command(service, C::NAME, data).await
    }
}
