//! RabbitMQ backend over AMQP 0-9-1.
//!
//! [`AmqpConnector`] opens one AMQP connection per [`MessageBusConnection`]
//! with three kinds of channels:
//!
//! | Channel | Used for |
//! |---------|----------|
//! | admin | exchange/queue declarations, bindings, deletes |
//! | publisher | `publish` and `send_to_queue` |
//! | one per consumer | `basic_consume` |
//!
//! A channel error closes only that channel; the admin and publisher
//! channels are reopened on next use. [`RabbitMqAdmin`] lists and deletes
//! queues through the management HTTP API, which AMQP itself cannot do.
//!
//! [`MessageBusConnection`]: crate::MessageBusConnection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrokerEndpoint;
use crate::error::TransportError;
use crate::transport::{
    Acker, Connector, Consumer, Delivery, Envelope, QueueAdmin, QueueOptions, Transport,
};

/// `delivery_mode` for messages that survive a broker restart
const PERSISTENT: u8 = 2;

const CONTENT_TYPE: &str = "application/json";

/// Map a lapin error on `name`. `NOT_FOUND` becomes `not_found(name)`.
fn map_error(e: lapin::Error, name: &str, not_found: fn(String) -> TransportError) -> TransportError {
    if let lapin::Error::ProtocolError(amqp) = &e {
        match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => {
                return TransportError::ResourceLocked(name.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => return not_found(name.to_string()),
            _ => {}
        }
    }
    TransportError::Unavailable(format!("{}: {}", name, e))
}

fn unavailable(e: lapin::Error) -> TransportError {
    TransportError::Unavailable(e.to_string())
}

/// AMQP URI for an endpoint. Credentials are never formatted into a string.
pub fn amqp_uri(endpoint: &BrokerEndpoint) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = endpoint.host.clone();
    uri.authority.port = endpoint.port;
    uri.authority.userinfo.username = endpoint.user.clone();
    uri.authority.userinfo.password = endpoint.password.clone();
    uri.vhost = endpoint.vhost.clone();
    uri
}

fn properties(envelope: &Envelope) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT);
    if let Some(id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &envelope.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    properties
}

/// Opens [`AmqpTransport`]s to one broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    endpoint: BrokerEndpoint,
}

impl AmqpConnector {
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let connection =
            Connection::connect_uri(amqp_uri(&self.endpoint), ConnectionProperties::default())
                .await
                .map_err(unavailable)?;
        info!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            vhost = %self.endpoint.vhost,
            "Connected to AMQP broker"
        );
        Ok(Arc::new(AmqpTransport::new(connection)))
    }
}

/// One AMQP connection.
pub struct AmqpTransport {
    connection: Connection,
    admin: Mutex<Option<Channel>>,
    publisher: Mutex<Option<Channel>>,
    closed: AtomicBool,
}

impl AmqpTransport {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            admin: Mutex::new(None),
            publisher: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.connection.status().connected() {
            return Err(TransportError::Unavailable(
                "AMQP connection lost".to_string(),
            ));
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<Channel, TransportError> {
        self.check_open()?;
        self.connection.create_channel().await.map_err(unavailable)
    }

    /// The channel cached in `slot`, reopened if the broker closed it.
    async fn cached(&self, slot: &Mutex<Option<Channel>>) -> Result<Channel, TransportError> {
        let mut slot = slot.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            debug!("AMQP channel closed by broker, reopening");
        }
        let channel = self.open_channel().await?;
        *slot = Some(channel.clone());
        Ok(channel)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let channel = self.cached(&self.publisher).await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties(envelope),
            )
            .await
            .map_err(|e| map_error(e, exchange, TransportError::ExchangeNotFound))?
            .await
            .map_err(|e| map_error(e, exchange, TransportError::ExchangeNotFound))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&self, name: &str) -> Result<(), TransportError> {
        let channel = self.cached(&self.admin).await?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(e, name, TransportError::ExchangeNotFound))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), TransportError> {
        let channel = self.cached(&self.admin).await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(e, name, TransportError::QueueNotFound))?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError> {
        let channel = self.cached(&self.admin).await?;
        channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(e, queue, TransportError::QueueNotFound))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.basic_publish(exchange, routing_key, &envelope).await
    }

    /// Publishes through the default exchange, which routes by queue name.
    async fn send_to_queue(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.basic_publish("", queue, &envelope).await
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, TransportError> {
        let channel = self.open_channel().await?;
        let tag = format!("{}-{}", queue, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(e, queue, TransportError::QueueNotFound))?;
        debug!(queue = queue, consumer_tag = %tag, "AMQP consumer started");
        Ok(Box::new(AmqpConsumer {
            queue: queue.to_string(),
            inner: consumer,
            _channel: channel,
        }))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        let channel = self.cached(&self.admin).await?;
        channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|e| map_error(e, name, TransportError::QueueNotFound))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(unavailable)?;
        info!("AMQP connection closed");
        Ok(())
    }
}

struct AmqpConsumer {
    queue: String,
    inner: lapin::Consumer,
    // Keeps the consuming channel alive with the consumer
    _channel: Channel,
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        match self.inner.next().await? {
            Ok(delivery) => Some(into_delivery(delivery)),
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "AMQP consumer stopped");
                None
            }
        }
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .map(|queue| queue.as_str().to_string());
    let envelope = Envelope {
        body: delivery.data,
        routing_key: delivery.routing_key.as_str().to_string(),
        correlation_id,
        reply_to,
    };
    Delivery::new(envelope, Box::new(AmqpAcker(delivery.acker)))
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(unavailable)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(unavailable)
    }
}

#[derive(Debug, Deserialize)]
struct QueueInfo {
    name: String,
}

/// Queue listing and deletion through the RabbitMQ management API.
#[derive(Debug, Clone)]
pub struct RabbitMqAdmin {
    client: reqwest::Client,
    queues_url: Url,
    user: String,
    password: String,
}

fn management(e: impl std::fmt::Display) -> TransportError {
    TransportError::Management(e.to_string())
}

impl RabbitMqAdmin {
    pub fn new(endpoint: &BrokerEndpoint) -> Result<Self, TransportError> {
        let mut queues_url = Url::parse(&format!(
            "http://{}:{}/",
            endpoint.host, endpoint.management_port
        ))
        .map_err(management)?;
        queues_url
            .path_segments_mut()
            .map_err(|_| management("management URL cannot have a path"))?
            .pop_if_empty()
            .push("api")
            .push("queues")
            .push(&endpoint.vhost);

        Ok(Self {
            client: reqwest::Client::new(),
            queues_url,
            user: endpoint.user.clone(),
            password: endpoint.password.clone(),
        })
    }

    /// `GET` endpoint listing the vhost's queues.
    pub fn queues_url(&self) -> &Url {
        &self.queues_url
    }

    fn queue_url(&self, name: &str) -> Result<Url, TransportError> {
        let mut url = self.queues_url.clone();
        url.path_segments_mut()
            .map_err(|_| management("management URL cannot have a path"))?
            .push(name);
        Ok(url)
    }
}

#[async_trait]
impl QueueAdmin for RabbitMqAdmin {
    async fn list_queues(&self) -> Result<Vec<String>, TransportError> {
        let queues: Vec<QueueInfo> = self
            .client
            .get(self.queues_url.clone())
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(management)?
            .error_for_status()
            .map_err(management)?
            .json()
            .await
            .map_err(management)?;
        Ok(queues.into_iter().map(|q| q.name).collect())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        let url = self.queue_url(name)?;
        let response = self
            .client
            .delete(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(management)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::QueueNotFound(name.to_string()));
        }
        response.error_for_status().map_err(management)?;
        debug!(queue = name, "Deleted queue through management API");
        Ok(())
    }
}
