//! Event bus: any number of handlers per event, run in registration order.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use super::contract::{Event, SchemaId};
use super::handler::EventHandler;
use crate::connection::{self, MessageBusConnection};
use crate::error::BusError;

type ErasedHandler = Arc<dyn Any + Send + Sync>;

struct EventBusInner {
    handlers: RwLock<HashMap<SchemaId, Vec<ErasedHandler>>>,
    subscribed: tokio::sync::Mutex<HashSet<SchemaId>>,
    connection: Option<MessageBusConnection>,
}

/// Publishes events locally and over the connection. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new(connection: Option<MessageBusConnection>) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                handlers: RwLock::new(HashMap::new()),
                subscribed: tokio::sync::Mutex::new(HashSet::new()),
                connection,
            }),
        }
    }

    /// Append a handler for `E`.
    ///
    /// When connected, `E` is also subscribed on the connection to
    /// `event.<E::NAME>` until that succeeds once, so events from other
    /// services reach the local handlers. They are not re-published. If the
    /// subscription fails the handler is removed again and the error returned.
    pub async fn register<E: Event>(
        &self,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Result<(), BusError> {
        let id = SchemaId::event::<E>();
        let erased: ErasedHandler = Arc::new(handler);
        self.inner
            .handlers
            .write()
            .entry(id)
            .or_default()
            .push(Arc::clone(&erased));
        debug!(schema = %id, "Event handler registered");

        let Some(connection) = &self.inner.connection else {
            return Ok(());
        };
        let mut subscribed = self.inner.subscribed.lock().await;
        if subscribed.contains(&id) {
            return Ok(());
        }

        let bus = Arc::downgrade(&self.inner);
        let subscription = connection
            .subscribe_event(
                E::NAME,
                connection::event_handler(move |data| {
                    let bus = Weak::clone(&bus);
                    async move {
                        let Some(inner) = bus.upgrade() else {
                            return Ok(());
                        };
                        let event: E = serde_json::from_value(data)?;
                        EventBus { inner }.dispatch_local(&event).await;
                        Ok(())
                    }
                }),
            )
            .await;

        match subscription {
            Ok(()) => {
                subscribed.insert(id);
                Ok(())
            }
            Err(e) => {
                let mut handlers = self.inner.handlers.write();
                if let Some(list) = handlers.get_mut(&id) {
                    list.retain(|h| !Arc::ptr_eq(h, &erased));
                    if list.is_empty() {
                        handlers.remove(&id);
                    }
                }
                warn!(schema = %id, error = %e, "Event subscription failed, handler removed");
                Err(e)
            }
        }
    }

    pub fn handler_count<E: Event>(&self) -> usize {
        self.inner
            .handlers
            .read()
            .get(&SchemaId::event::<E>())
            .map_or(0, Vec::len)
    }

    /// Publish externally (when connected), then run every local handler.
    ///
    /// Errors are logged, never returned. Returns how many local handlers
    /// succeeded.
    pub async fn publish<E: Event>(&self, event: E) -> usize {
        if let Some(connection) = &self.inner.connection {
            match serde_json::to_value(&event) {
                Ok(data) => match connection.publish_event(E::NAME, data, None).await {
                    Ok(Some(())) => {}
                    Ok(None) => warn!(event = E::NAME, "Event not published, circuit open"),
                    Err(e) => error!(event = E::NAME, error = %e, "Failed to publish event"),
                },
                Err(e) => error!(event = E::NAME, error = %e, "Failed to serialize event"),
            }
        }
        self.dispatch_local(&event).await
    }

    async fn dispatch_local<E: Event>(&self, event: &E) -> usize {
        let handlers: Vec<Arc<dyn EventHandler<E>>> = self
            .inner
            .handlers
            .read()
            .get(&SchemaId::event::<E>())
            .map(|list| {
                list.iter()
                    .filter_map(|h| h.downcast_ref::<Arc<dyn EventHandler<E>>>().cloned())
                    .collect()
            })
            .unwrap_or_default();

        let mut succeeded = 0;
        for (index, handler) in handlers.iter().enumerate() {
            match handler.handle(event.clone()).await {
                Ok(()) => succeeded += 1,
                Err(e) => error!(
                    event = E::NAME,
                    handler = index,
                    error = %e,
                    "Event handler failed"
                ),
            }
        }
        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cqrs::contract::Contract;
    use crate::cqrs::handler::event_handler_fn;
    use crate::memory::InMemoryBroker;
    use crate::MessageBusConfig;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use shared_resilience::CircuitBreakerRegistry;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct UserCreated {
        user_id: u64,
    }

    impl Contract for UserCreated {
        const NAME: &'static str = "UserCreatedEvent";
    }

    impl Event for UserCreated {}

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        label: &'static str,
        fail: bool,
    ) -> Arc<dyn EventHandler<UserCreated>> {
        let log = Arc::clone(log);
        event_handler_fn(move |event: UserCreated| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{}:{}", label, event.user_id));
                if fail {
                    anyhow::bail!("{} failed", label);
                }
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_local_handlers_run_in_order_despite_failure() {
        let bus = EventBus::new(None);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(recorder(&log, "a", true)).await.unwrap();
        bus.register(recorder(&log, "b", false)).await.unwrap();
        bus.register(recorder(&log, "c", false)).await.unwrap();
        assert_eq!(bus.handler_count::<UserCreated>(), 3);

        let succeeded = bus.publish(UserCreated { user_id: 4 }).await;
        assert_eq!(succeeded, 2);
        assert_eq!(*log.lock(), vec!["a:4", "b:4", "c:4"]);
    }

    #[tokio::test]
    async fn test_publish_without_handlers() {
        let bus = EventBus::new(None);
        assert_eq!(bus.publish(UserCreated { user_id: 1 }).await, 0);
    }

    #[tokio::test]
    async fn test_external_events_reach_local_handlers() {
        let broker = InMemoryBroker::new();
        let connect = |service: &'static str| {
            let broker = broker.clone();
            async move {
                MessageBusConnection::connect(
                    &broker,
                    MessageBusConfig::for_service(service),
                    Arc::new(CircuitBreakerRegistry::new()),
                )
                .await
                .unwrap()
            }
        };

        let quests = EventBus::new(Some(connect("quests").await));
        let log = Arc::new(Mutex::new(Vec::new()));
        quests.register(recorder(&log, "quests", false)).await.unwrap();

        let users = EventBus::new(Some(connect("users").await));
        // No local handlers on the publisher side.
        assert_eq!(users.publish(UserCreated { user_id: 11 }).await, 0);

        for _ in 0..100 {
            if !log.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*log.lock(), vec!["quests:11"]);
    }

    /// A subscription that fails during an outage is retried by the next
    /// registration.
    #[tokio::test]
    async fn test_failed_subscription_is_retried() {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let quests_connection = MessageBusConnection::connect(
            &broker,
            MessageBusConfig::for_service("quests"),
            Arc::clone(&registry),
        )
        .await
        .unwrap();
        let users_connection =
            MessageBusConnection::connect(&broker, MessageBusConfig::for_service("users"), registry)
                .await
                .unwrap();

        let quests = EventBus::new(Some(quests_connection));
        let log = Arc::new(Mutex::new(Vec::new()));

        broker.set_available(false);
        assert!(quests.register(recorder(&log, "first", false)).await.is_err());
        assert_eq!(quests.handler_count::<UserCreated>(), 0);
        assert!(!broker.queue_names().contains(&"quests_events".to_string()));

        broker.set_available(true);
        quests.register(recorder(&log, "second", false)).await.unwrap();
        assert_eq!(quests.handler_count::<UserCreated>(), 1);
        assert!(broker.queue_names().contains(&"quests_events".to_string()));

        let users = EventBus::new(Some(users_connection));
        users.publish(UserCreated { user_id: 7 }).await;

        for _ in 0..100 {
            if !log.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*log.lock(), vec!["second:7"]);
    }
}
