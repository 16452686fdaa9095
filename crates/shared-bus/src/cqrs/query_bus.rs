//! Query bus: one handler per query, executed behind a circuit breaker.

use std::any::Any;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use shared_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, Fallback};
use tracing::{debug, error, warn};

use super::contract::{Query, QueryResult, SchemaId};
use super::handler::QueryHandler;
use crate::connection::{self, MessageBusConnection};
use crate::error::BusError;

/// Breaker guarding [`QueryBus::execute`].
pub const QUERY_BUS_BREAKER: &str = "query_bus_execute";

type ErasedHandler = Arc<dyn Any + Send + Sync>;

struct QueryBusInner {
    handlers: RwLock<HashMap<SchemaId, ErasedHandler>>,
    connection: Option<MessageBusConnection>,
    breakers: Arc<CircuitBreakerRegistry>,
}

/// Routes queries to their handlers. Cheap to clone.
#[derive(Clone)]
pub struct QueryBus {
    inner: Arc<QueryBusInner>,
}

impl QueryBus {
    pub fn new(
        connection: Option<MessageBusConnection>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(QueryBusInner {
                handlers: RwLock::new(HashMap::new()),
                connection,
                breakers,
            }),
        }
    }

    /// Register the handler for `Q`, replacing any previous one.
    ///
    /// With a connection, queries named `Q::NAME` arriving over the transport
    /// are answered with the serialized [`QueryResult`]. A payload that does
    /// not deserialize into `Q` is answered with a failure result.
    pub fn register<Q: Query>(&self, handler: Arc<dyn QueryHandler<Q>>) {
        let id = SchemaId::query::<Q>();
        let erased: ErasedHandler = Arc::new(handler);
        if self.inner.handlers.write().insert(id, erased).is_some() {
            warn!(schema = %id, "Overwriting existing query handler");
        }

        if let Some(connection) = &self.inner.connection {
            let bus = Arc::downgrade(&self.inner);
            connection.register_query(
                Q::NAME,
                connection::query_handler(move |data| {
                    let bus = Weak::clone(&bus);
                    async move {
                        let bus = bus
                            .upgrade()
                            .map(|inner| QueryBus { inner })
                            .ok_or_else(|| anyhow::anyhow!("query bus dropped"))?;
                        let result = match serde_json::from_value::<Q>(data) {
                            Ok(query) => bus.execute(query).await,
                            Err(e) => {
                                warn!(query = Q::NAME, error = %e, "Invalid query payload");
                                QueryResult::failure(
                                    format!("Invalid payload for query {}", Q::NAME),
                                    vec![e.to_string()],
                                )
                            }
                        };
                        Ok(serde_json::to_value(result)?)
                    }
                }),
            );
        }
        debug!(schema = %id, "Query handler registered");
    }

    pub fn has_handler<Q: Query>(&self) -> bool {
        self.handler::<Q>().is_some()
    }

    fn handler<Q: Query>(&self) -> Option<Arc<dyn QueryHandler<Q>>> {
        let handlers = self.inner.handlers.read();
        handlers
            .get(&SchemaId::query::<Q>())?
            .downcast_ref::<Arc<dyn QueryHandler<Q>>>()
            .cloned()
    }

    /// Execute a query locally.
    ///
    /// Never fails: a missing handler, a handler error or an open breaker all
    /// produce a failure result. Handler errors are not breaker failures.
    pub async fn execute<Q: Query>(&self, query: Q) -> QueryResult<Q::Output> {
        let handler = self.handler::<Q>();
        let guard = self.inner.breakers.guard(
            QUERY_BUS_BREAKER,
            CircuitBreakerConfig::new(5, Duration::from_secs(30)),
            Fallback::with(|| {
                QueryResult::failure(
                    "Service temporarily unavailable",
                    vec![format!("circuit '{}' is open", QUERY_BUS_BREAKER)],
                )
            }),
        );

        let outcome = guard
            .call(|| async move {
                let result = match handler {
                    Some(handler) => match handler.handle(query).await {
                        Ok(data) => QueryResult::ok(data),
                        Err(e) => {
                            error!(query = Q::NAME, error = %e, "Query handler failed");
                            QueryResult::failure(
                                format!("Query {} failed", Q::NAME),
                                vec![e.to_string()],
                            )
                        }
                    },
                    None => {
                        warn!(query = Q::NAME, "No handler registered for query");
                        QueryResult::failure(
                            format!("No handler registered for query {}", Q::NAME),
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

    /// Ask another service over the connection.
    ///
    /// `Ok(None)` means the send breaker is open.
    pub async fn query_remote<Q: Query>(
        &self,
        service: &str,
        query: &Q,
    ) -> Result<Option<QueryResult<Q::Output>>, BusError> {
        let connection = self.inner.connection.as_ref().ok_or(BusError::NotConnected)?;
        let data = serde_json::to_value(query)?;
        match connection.send_query(service, Q::NAME, data).await? {
            Some(response) => Ok(Some(decode_result(response)?)),
            None => Ok(None),
        }
    }
}

fn decode_result<T: serde::de::DeserializeOwned>(value: Value) -> Result<QueryResult<T>, BusError> {
    Ok(serde_json::from_value(value)?)
}
