//! Message bus connection: command, event and query (RPC) patterns over a
//! topic-exchange [`Transport`].
//!
//! ## Topology
//!
//! | Resource | Kind | Bound to |
//! |----------|------|----------|
//! | `<exchange>` | topic, durable | |
//! | `<service>_queue` | durable | `command.<service>.#`, `query.<service>.#` |
//! | `<service>_events` | durable, on first subscription | `event.<pattern>` |
//! | `<callback>_<uuid>` | exclusive, auto-delete | direct sends only |
//!
//! ## Delivery policy
//!
//! Every delivery is processed on its own task. It is acked once its handler
//! succeeds (or when no handler exists for its name) and rejected without
//! requeue when the payload is malformed or the handler fails.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use shared_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitGuard, Fallback};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MessageBusConfig;
use crate::correlation::CorrelationId;
use crate::error::BusError;
use crate::message::{Message, MessageType};
use crate::pending::{self, PendingQueries, PendingSnapshot};
use crate::topic;
use crate::transport::{Connector, Consumer, Delivery, Envelope, QueueAdmin, QueueOptions, Transport};

/// Breaker guarding `publish_event`.
pub const PUBLISH_EVENT_BREAKER: &str = "bus_publish_event";
/// Breaker guarding `send_command`.
pub const SEND_COMMAND_BREAKER: &str = "bus_send_command";
/// Breaker guarding `send_query`.
pub const SEND_QUERY_BREAKER: &str = "bus_send_query";

/// Handles a command payload.
pub type CommandHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
/// Handles a query payload and produces the response data.
pub type QueryHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
/// Handles an event payload.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`CommandHandler`].
pub fn command_handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |data| f(data).boxed())
}

/// Wrap an async closure as a [`QueryHandler`].
pub fn query_handler<F, Fut>(f: F) -> QueryHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |data| f(data).boxed())
}

/// Wrap an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |data| f(data).boxed())
}

#[derive(Default)]
struct Handlers {
    commands: HashMap<String, CommandHandler>,
    queries: HashMap<String, QueryHandler>,
    events: HashMap<String, Vec<EventHandler>>,
}

#[derive(Default)]
struct EventSubscription {
    consuming: bool,
    patterns: HashSet<String>,
}

struct ConnectionInner {
    config: MessageBusConfig,
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    callback_queue: String,
    pending: Arc<PendingQueries>,
    handlers: RwLock<Handlers>,
    events: tokio::sync::Mutex<EventSubscription>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Connection to the message bus. Cheap to clone.
#[derive(Clone)]
pub struct MessageBusConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for MessageBusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusConnection")
            .field("service", &self.inner.config.service_name)
            .field("callback_queue", &self.inner.callback_queue)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MessageBusConnection {
    /// Connect, declare the topology and start consuming.
    ///
    /// The transport is closed again if any step after connecting fails.
    pub async fn connect(
        connector: &dyn Connector,
        config: MessageBusConfig,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let transport = connector.connect().await?;

        match Self::setup(Arc::clone(&transport), config, breakers).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!(error = %close_err, "Failed to close transport after setup error");
                }
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect), recovering once from a locked callback queue.
    ///
    /// On `ResourceLocked` the stale `<service>_callback*` queues left by a
    /// previous instance are deleted through `admin` and the connection is
    /// retried. If cleanup or the retry fails, the original error is returned.
    pub async fn connect_with_recovery(
        connector: &dyn Connector,
        admin: &dyn QueueAdmin,
        config: MessageBusConfig,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, BusError> {
        let original = match Self::connect(connector, config.clone(), Arc::clone(&breakers)).await {
            Ok(connection) => return Ok(connection),
            Err(e) if e.is_resource_locked() => e,
            Err(e) => return Err(e),
        };

        warn!(
            service = %config.service_name,
            error = %original,
            "Message bus resources locked, cleaning up stale callback queues"
        );
        tokio::time::sleep(config.lock_recovery_delay).await;

        match cleanup_stale_callback_queues(admin, &config.service_name).await {
            Ok(removed) => info!(removed = removed, "Stale callback queues removed"),
            Err(e) => {
                error!(error = %e, "Stale queue cleanup failed");
                return Err(original);
            }
        }
        tokio::time::sleep(config.reconnect_delay).await;

        match Self::connect(connector, config, breakers).await {
            Ok(connection) => {
                info!("Reconnected to message bus after lock recovery");
                Ok(connection)
            }
            Err(e) => {
                error!(error = %e, "Reconnect after lock recovery failed");
                Err(original)
            }
        }
    }

    async fn setup(
        transport: Arc<dyn Transport>,
        config: MessageBusConfig,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, BusError> {
        let service = config.service_name.clone();
        transport.declare_exchange(&config.exchange).await?;

        let service_queue = config.service_queue();
        transport
            .declare_queue(&service_queue, QueueOptions::durable())
            .await?;
        for pattern in [format!("command.{}.#", service), format!("query.{}.#", service)] {
            transport
                .bind_queue(&service_queue, &config.exchange, &pattern)
                .await?;
        }

        let callback_queue = format!("{}_{}", config.callback_base(), Uuid::new_v4());
        transport
            .declare_queue(&callback_queue, QueueOptions::exclusive())
            .await?;

        let service_consumer = transport.consume(&service_queue).await?;
        let callback_consumer = transport.consume(&callback_queue).await?;

        let pending = Arc::new(PendingQueries::new(config.query_timeout));
        let sweep_interval = config.sweep_interval;
        let inner = Arc::new(ConnectionInner {
            config,
            transport,
            breakers,
            callback_queue,
            pending: Arc::clone(&pending),
            handlers: RwLock::new(Handlers::default()),
            events: tokio::sync::Mutex::new(EventSubscription::default()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        {
            let mut tasks = inner.tasks.lock();
            tasks.push(spawn_consumer(weak.clone(), service_consumer, Route::Inbound));
            tasks.push(spawn_consumer(weak, callback_consumer, Route::Callback));
            tasks.push(tokio::spawn(pending::cleanup_task(pending, sweep_interval)));
        }

        info!(
            service = %service,
            exchange = %inner.config.exchange,
            callback_queue = %inner.callback_queue,
            "Connected to message bus"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &MessageBusConfig {
        &self.inner.config
    }

    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    /// Name of this connection's exclusive reply queue.
    pub fn callback_queue(&self) -> &str {
        &self.inner.callback_queue
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.pending_count()
    }

    pub fn pending_stats(&self) -> PendingSnapshot {
        self.inner.pending.snapshot()
    }

    /// Install the handler for commands named `name`. Replaces any previous one.
    pub fn register_command(&self, name: &str, handler: CommandHandler) {
        if self
            .inner
            .handlers
            .write()
            .commands
            .insert(name.to_string(), handler)
            .is_some()
        {
            warn!(command = name, "Replacing existing command handler");
        }
        debug!(command = name, "Command handler registered");
    }

    /// Install the handler for queries named `name`. Replaces any previous one.
    pub fn register_query(&self, name: &str, handler: QueryHandler) {
        if self
            .inner
            .handlers
            .write()
            .queries
            .insert(name.to_string(), handler)
            .is_some()
        {
            warn!(query = name, "Replacing existing query handler");
        }
        debug!(query = name, "Query handler registered");
    }

    /// Bind `event.<name>` if it is not bound yet, then append a handler for
    /// events named `name`.
    ///
    /// Nothing is registered when the binding fails, so a later call retries
    /// the subscription.
    pub async fn subscribe_event(&self, name: &str, handler: EventHandler) -> Result<(), BusError> {
        self.subscribe_to_events(&[name]).await?;
        self.inner
            .handlers
            .write()
            .events
            .entry(name.to_string())
            .or_default()
            .push(handler);
        debug!(event = name, "Event handler registered");
        Ok(())
    }

    /// Bind `event.<pattern>` for each pattern to `<service>_events` and
    /// start consuming it.
    pub async fn subscribe_to_events(&self, patterns: &[&str]) -> Result<(), BusError> {
        self.ensure_open()?;
        let config = &self.inner.config;
        let queue = config.events_queue();
        let mut subscription = self.inner.events.lock().await;

        if !subscription.consuming {
            self.inner
                .transport
                .declare_queue(&queue, QueueOptions::durable())
                .await?;
        }
        for pattern in patterns {
            if subscription.patterns.contains(*pattern) {
                continue;
            }
            self.inner
                .transport
                .bind_queue(&queue, &config.exchange, &topic::event_key(pattern))
                .await?;
            subscription.patterns.insert(pattern.to_string());
            debug!(queue = %queue, pattern = pattern, "Subscribed to events");
        }
        if !subscription.consuming {
            let consumer = self.inner.transport.consume(&queue).await?;
            let task = spawn_consumer(Arc::downgrade(&self.inner), consumer, Route::Inbound);
            self.inner.tasks.lock().push(task);
            subscription.consuming = true;
        }
        Ok(())
    }

    /// Publish an event to `event.<name>` or to `routing_key` if given.
    ///
    /// Returns `Ok(None)` without publishing while the publish breaker is open.
    pub async fn publish_event(
        &self,
        name: &str,
        data: Value,
        routing_key: Option<&str>,
    ) -> Result<Option<()>, BusError> {
        let key = routing_key
            .map(str::to_string)
            .unwrap_or_else(|| topic::event_key(name));
        let message = Message::event(name, data);

        self.guard(PUBLISH_EVENT_BREAKER)
            .call(|| async {
                self.publish(&key, Envelope::new(message.to_bytes()?)).await?;
                debug!(event = name, routing_key = %key, "Published event");
                Ok::<_, BusError>(Some(()))
            })
            .await
    }

    /// Send a command to `service`.
    ///
    /// Returns `Ok(None)` without sending while the command breaker is open.
    pub async fn send_command(
        &self,
        service: &str,
        name: &str,
        data: Value,
    ) -> Result<Option<()>, BusError> {
        let key = topic::command_key(service, name);
        let message = Message::command(name, data);

        self.guard(SEND_COMMAND_BREAKER)
            .call(|| async {
                self.publish(&key, Envelope::new(message.to_bytes()?)).await?;
                debug!(command = name, routing_key = %key, "Sent command");
                Ok::<_, BusError>(Some(()))
            })
            .await
    }

    /// Send a query to `service` and wait for the response data, up to the
    /// configured `query_timeout`.
    pub async fn send_query(
        &self,
        service: &str,
        name: &str,
        data: Value,
    ) -> Result<Option<Value>, BusError> {
        self.send_query_with_timeout(service, name, data, self.inner.config.query_timeout)
            .await
    }

    /// [`send_query`](Self::send_query) with an explicit deadline.
    ///
    /// On expiry the pending entry is evicted and `QueryTimeout` returned.
    /// Returns `Ok(None)` without sending while the query breaker is open.
    pub async fn send_query_with_timeout(
        &self,
        service: &str,
        name: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, BusError> {
        let key = topic::query_key(service, name);

        self.guard(SEND_QUERY_BREAKER)
            .call(|| async move {
                let pending = &self.inner.pending;
                let (correlation_id, rx) = pending.register(name, Some(timeout));
                let message = Message::query(name, data, correlation_id, &self.inner.callback_queue);

                let sent = match message.to_bytes() {
                    Ok(body) => {
                        let envelope = Envelope::new(body)
                            .with_correlation_id(correlation_id.to_string())
                            .with_reply_to(self.inner.callback_queue.clone());
                        self.publish(&key, envelope).await
                    }
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    pending.cancel(&correlation_id);
                    return Err(e);
                }
                debug!(query = name, correlation_id = %correlation_id, "Sent query");

                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(outcome)) => outcome.map(Some),
                    Ok(Err(_)) => Err(BusError::ConnectionClosed),
                    Err(_) => {
                        pending.expire(&correlation_id);
                        warn!(
                            query = name,
                            correlation_id = %correlation_id,
                            timeout_ms = timeout.as_millis(),
                            "Query timed out"
                        );
                        Err(BusError::QueryTimeout {
                            name: name.to_string(),
                            timeout,
                        })
                    }
                }
            })
            .await
    }

    /// Stop consuming, drop the callback queue, fail outstanding queries and
    /// close the transport.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let failed = self.inner.pending.fail_all();

        if let Err(e) = self
            .inner
            .transport
            .delete_queue(&self.inner.callback_queue)
            .await
        {
            debug!(error = %e, "Callback queue already gone");
        }
        self.inner.transport.close().await?;

        info!(
            service = %self.inner.config.service_name,
            failed_queries = failed,
            "Message bus connection closed"
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn publish(&self, routing_key: &str, envelope: Envelope) -> Result<(), BusError> {
        self.ensure_open()?;
        self.inner
            .transport
            .publish(&self.inner.config.exchange, routing_key, envelope)
            .await?;
        Ok(())
    }

    /// Looked up on every call so a registry `reset` takes effect.
    fn guard<T>(&self, name: &str) -> CircuitGuard<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let config = CircuitBreakerConfig::new(
            self.inner.config.breaker_failure_threshold,
            self.inner.config.breaker_recovery_timeout,
        );
        self.inner.breakers.guard(name, config, Fallback::value(None))
    }
}

/// Delete every queue whose name contains `<service>_callback`.
pub async fn cleanup_stale_callback_queues(
    admin: &dyn QueueAdmin,
    service: &str,
) -> Result<usize, BusError> {
    let needle = format!("{}_callback", service);
    let mut removed = 0;
    for queue in admin.list_queues().await? {
        if queue.contains(&needle) {
            admin.delete_queue(&queue).await?;
            debug!(queue = %queue, "Deleted stale callback queue");
            removed += 1;
        }
    }
    Ok(removed)
}

#[derive(Clone, Copy)]
enum Route {
    /// Service and events queues
    Inbound,
    /// Reply queue
    Callback,
}

fn spawn_consumer(
    inner: Weak<ConnectionInner>,
    mut consumer: Box<dyn Consumer>,
    route: Route,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match route {
                Route::Inbound => tokio::spawn(process_message(inner, delivery)),
                Route::Callback => tokio::spawn(process_response(inner, delivery)),
            };
        }
        debug!("Consumer stopped");
    })
}

async fn settle(delivery: Delivery, outcome: anyhow::Result<()>) {
    let result = match outcome {
        Ok(()) => delivery.ack().await,
        Err(_) => delivery.reject(false).await,
    };
    if let Err(e) = result {
        warn!(error = %e, "Failed to settle delivery");
    }
}

async fn process_message(inner: Arc<ConnectionInner>, delivery: Delivery) {
    let message = match Message::from_slice(&delivery.envelope.body) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                routing_key = %delivery.envelope.routing_key,
                error = %e,
                "Malformed message, dead-lettering"
            );
            settle(delivery, Err(e.into())).await;
            return;
        }
    };

    let outcome = match message.message_type {
        MessageType::Command => dispatch_command(&inner, &message).await,
        MessageType::Query => dispatch_query(&inner, &message, &delivery.envelope).await,
        MessageType::Event => {
            dispatch_event(&inner, &message).await;
            Ok(())
        }
        MessageType::Response => {
            warn!(name = %message.name, "Response delivered to a service queue, dropping");
            Ok(())
        }
    };

    if let Err(e) = &outcome {
        error!(
            kind = %message.message_type,
            name = %message.name,
            id = %message.id,
            error = %e,
            "Handler failed, dead-lettering message"
        );
    }
    settle(delivery, outcome).await;
}

async fn dispatch_command(inner: &ConnectionInner, message: &Message) -> anyhow::Result<()> {
    let handler = inner.handlers.read().commands.get(&message.name).cloned();
    match handler {
        Some(handler) => {
            debug!(command = %message.name, id = %message.id, "Dispatching command");
            handler(message.data.clone()).await
        }
        None => {
            warn!(command = %message.name, "No handler for command, dropping");
            Ok(())
        }
    }
}

async fn dispatch_query(
    inner: &ConnectionInner,
    message: &Message,
    envelope: &Envelope,
) -> anyhow::Result<()> {
    let handler = inner.handlers.read().queries.get(&message.name).cloned();
    let Some(handler) = handler else {
        warn!(query = %message.name, "No handler for query, dropping");
        return Ok(());
    };

    let data = handler(message.data.clone()).await?;

    let reply_to = message.reply_to.as_ref().or(envelope.reply_to.as_ref());
    let correlation_id = message
        .correlation_id
        .as_ref()
        .or(envelope.correlation_id.as_ref());
    let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) else {
        warn!(query = %message.name, "Query without reply_to or correlation_id, response dropped");
        return Ok(());
    };

    let response = Message::response(&message.name, data, correlation_id.clone());
    let envelope = Envelope::new(response.to_bytes()?).with_correlation_id(correlation_id.clone());
    inner.transport.send_to_queue(reply_to, envelope).await?;
    debug!(query = %message.name, correlation_id = %correlation_id, "Sent query response");
    Ok(())
}

/// Runs every handler for the event in registration order; failures are
/// logged and do not stop later handlers.
async fn dispatch_event(inner: &ConnectionInner, message: &Message) {
    let handlers = inner
        .handlers
        .read()
        .events
        .get(&message.name)
        .cloned()
        .unwrap_or_default();
    if handlers.is_empty() {
        debug!(event = %message.name, "No local handlers for event");
        return;
    }

    for (index, handler) in handlers.iter().enumerate() {
        if let Err(e) = handler(message.data.clone()).await {
            error!(
                event = %message.name,
                handler = index,
                error = %e,
                "Event handler failed"
            );
        }
    }
}

async fn process_response(inner: Arc<ConnectionInner>, delivery: Delivery) {
    let message = match Message::from_slice(&delivery.envelope.body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Malformed response, dead-lettering");
            settle(delivery, Err(e.into())).await;
            return;
        }
    };

    let raw_id = message
        .correlation_id
        .as_deref()
        .or(delivery.envelope.correlation_id.as_deref());
    match raw_id.map(CorrelationId::parse) {
        Some(Ok(correlation_id)) => {
            // Unknown ids are logged inside `complete`
            inner.pending.complete(correlation_id, message.data);
        }
        _ => warn!(name = %message.name, "Response without a valid correlation_id, dropping"),
    }
    settle(delivery, Ok(())).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::memory::InMemoryBroker;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn config(service: &str) -> MessageBusConfig {
        MessageBusConfig {
            lock_recovery_delay: Duration::from_millis(1),
            reconnect_delay: Duration::from_millis(1),
            ..MessageBusConfig::for_service(service)
        }
    }

    async fn connect(broker: &InMemoryBroker, service: &str) -> MessageBusConnection {
        MessageBusConnection::connect(
            broker,
            config(service),
            Arc::new(CircuitBreakerRegistry::new()),
        )
        .await
        .unwrap()
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for handler")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_topology_declared() {
        let broker = InMemoryBroker::new();
        let conn = connect(&broker, "users").await;

        let queues = broker.queue_names();
        assert!(queues.contains(&"users_queue".to_string()));
        assert!(conn.callback_queue().starts_with("users_callback_"));
        assert!(queues.contains(&conn.callback_queue().to_string()));
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let broker = InMemoryBroker::new();
        let users = connect(&broker, "users").await;
        let gateway = connect(&broker, "gateway").await;

        users.register_query(
            "GetUserQuery",
            query_handler(|data: Value| async move {
                Ok(json!({"id": data["user_id"], "name": "ada"}))
            }),
        );

        let response = gateway
            .send_query("users", "GetUserQuery", json!({"user_id": 7}))
            .await
            .unwrap();
        assert_eq!(response, Some(json!({"id": 7, "name": "ada"})));
        assert_eq!(gateway.pending_count(), 0);
        assert_eq!(gateway.pending_stats().total_completed, 1);
    }

    #[tokio::test]
    async fn test_query_timeout_evicts_pending_entry() {
        let broker = InMemoryBroker::new();
        let gateway = connect(&broker, "gateway").await;

        let result = gateway
            .send_query_with_timeout("nobody", "GetUserQuery", json!({}), Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(BusError::QueryTimeout { .. })));
        assert_eq!(gateway.pending_count(), 0);
        assert_eq!(gateway.pending_stats().total_timeouts, 1);
    }

    /// A response for someone else's correlation id is acked and dropped;
    /// the waiting query still times out.
    #[tokio::test]
    async fn test_foreign_response_is_acked_and_ignored() {
        let broker = InMemoryBroker::new();
        let gateway = connect(&broker, "gateway").await;
        let callback = gateway.callback_queue().to_string();

        let caller = gateway.clone();
        let query = tokio::spawn(async move {
            caller
                .send_query_with_timeout("nobody", "GetUserQuery", json!({}), Duration::from_millis(150))
                .await
        });
        while gateway.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let acked = broker.stats().acked;
        let foreign = CorrelationId::new();
        let body = Message::response("GetUserQuery", json!({"id": 1}), foreign.to_string())
            .to_bytes()
            .unwrap();
        let injector = broker.open().unwrap();
        injector
            .send_to_queue(&callback, Envelope::new(body).with_correlation_id(foreign.to_string()))
            .await
            .unwrap();

        for _ in 0..100 {
            if broker.stats().acked > acked {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(broker.stats().acked, acked + 1);
        assert_eq!(broker.queue_depth(&callback), Some(0));
        assert_eq!(gateway.pending_count(), 1);

        let result = query.await.unwrap();
        assert!(matches!(result, Err(BusError::QueryTimeout { .. })));
        assert_eq!(gateway.pending_count(), 0);
        assert_eq!(gateway.pending_stats().total_completed, 0);
        assert!(broker.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_command_dispatch_and_ack() {
        let broker = InMemoryBroker::new();
        let users = connect(&broker, "users").await;
        let gateway = connect(&broker, "gateway").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        users.register_command(
            "CreateUserCommand",
            command_handler(move |data: Value| {
                let tx = tx.clone();
                async move {
                    tx.send(data)?;
                    Ok(())
                }
            }),
        );

        let sent = gateway
            .send_command("users", "CreateUserCommand", json!({"email": "a@b.c"}))
            .await
            .unwrap();
        assert_eq!(sent, Some(()));
        assert_eq!(recv(&mut rx).await["email"], "a@b.c");
    }

    #[tokio::test]
    async fn test_failing_handler_dead_letters() {
        let broker = InMemoryBroker::new();
        let users = connect(&broker, "users").await;
        let gateway = connect(&broker, "gateway").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        users.register_command(
            "Explode",
            command_handler(move |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                    anyhow::bail!("boom")
                }
            }),
        );

        gateway.send_command("users", "Explode", json!({})).await.unwrap();
        recv(&mut rx).await;

        // Settlement happens right after the handler returns.
        for _ in 0..50 {
            if !broker.dead_letters().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.queue_depth("users_queue"), Some(0));
    }

    #[tokio::test]
    async fn test_event_handlers_run_in_order_despite_failure() {
        let broker = InMemoryBroker::new();
        let quests = connect(&broker, "quests").await;
        let users = connect(&broker, "users").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        quests
            .subscribe_event(
                "UserCreatedEvent",
                event_handler(move |_| {
                    let tx = first.clone();
                    async move {
                        tx.send("first")?;
                        anyhow::bail!("first handler fails")
                    }
                }),
            )
            .await
            .unwrap();
        quests
            .subscribe_event(
                "UserCreatedEvent",
                event_handler(move |_| {
                    let tx = tx.clone();
                    async move {
                        tx.send("second")?;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        assert!(broker.queue_names().contains(&"quests_events".to_string()));

        users
            .publish_event("UserCreatedEvent", json!({"user_id": 1}), None)
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, "first");
        assert_eq!(recv(&mut rx).await, "second");
    }

    #[tokio::test]
    async fn test_open_breaker_returns_none() {
        let broker = InMemoryBroker::new();
        let conn = connect(&broker, "users").await;
        broker.set_available(false);

        for _ in 0..3 {
            assert!(conn.send_command("quests", "Ping", json!({})).await.is_err());
        }
        // Breaker is open: no transport call, fallback value.
        assert_eq!(conn.send_command("quests", "Ping", json!({})).await.unwrap(), None);

        // Other operations have their own breakers.
        assert!(conn.publish_event("Pinged", json!({}), None).await.is_err());
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_queries() {
        let broker = InMemoryBroker::new();
        let gateway = connect(&broker, "gateway").await;
        let callback = gateway.callback_queue().to_string();

        let caller = gateway.clone();
        let waiting = tokio::spawn(async move {
            caller.send_query("nobody", "GetUserQuery", json!({})).await
        });
        while gateway.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        gateway.close().await.unwrap();
        assert!(matches!(waiting.await.unwrap(), Err(BusError::ConnectionClosed)));
        assert!(!broker.queue_names().contains(&callback));
        assert!(gateway.is_closed());
        assert!(matches!(
            gateway.send_command("users", "X", json!({})).await,
            Err(BusError::ConnectionClosed)
        ));
    }

    /// Fails the first `failures` connects with a locked resource.
    struct LockedConnector {
        broker: InMemoryBroker,
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for LockedConnector {
        async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(TransportError::ResourceLocked("users_callback_stale".into()));
            }
            self.broker.connect().await
        }
    }

    #[tokio::test]
    async fn test_lock_recovery_cleans_stale_callback_queues() {
        let broker = InMemoryBroker::new();
        let stale = broker.open().unwrap();
        stale
            .declare_queue("users_callback_stale", QueueOptions::exclusive())
            .await
            .unwrap();

        let connector = LockedConnector {
            broker: broker.clone(),
            failures: 1,
            attempts: AtomicUsize::new(0),
        };
        let conn = MessageBusConnection::connect_with_recovery(
            &connector,
            &broker,
            config("users"),
            Arc::new(CircuitBreakerRegistry::new()),
        )
        .await
        .unwrap();

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        let queues = broker.queue_names();
        assert!(!queues.contains(&"users_callback_stale".to_string()));
        assert!(queues.contains(&conn.callback_queue().to_string()));
    }

    #[tokio::test]
    async fn test_lock_recovery_returns_original_error() {
        let broker = InMemoryBroker::new();
        let connector = LockedConnector {
            broker: broker.clone(),
            failures: usize::MAX,
            attempts: AtomicUsize::new(0),
        };

        let err = MessageBusConnection::connect_with_recovery(
            &connector,
            &broker,
            config("users"),
            Arc::new(CircuitBreakerRegistry::new()),
        )
        .await
        .unwrap_err();

        assert!(err.is_resource_locked());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }
}
