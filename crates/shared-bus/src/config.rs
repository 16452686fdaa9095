//! Message bus connection configuration.

use std::env;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default topic exchange shared by all services.
pub const DEFAULT_EXCHANGE: &str = "quest_logger";

/// Default AMQP port
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Default RabbitMQ management API port
pub const DEFAULT_MANAGEMENT_PORT: u16 = 15672;

/// Location and credentials of a RabbitMQ broker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Port of the management HTTP API used for stale queue cleanup
    pub management_port: u16,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_AMQP_PORT,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            management_port: DEFAULT_MANAGEMENT_PORT,
        }
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("management_port", &self.management_port)
            .finish()
    }
}

impl BrokerEndpoint {
    /// Read the broker endpoint from the environment. `None` unless
    /// `RABBITMQ_HOST` is set.
    ///
    /// - `RABBITMQ_HOST`: broker host
    /// - `RABBITMQ_PORT`: AMQP port (default: 5672)
    /// - `RABBITMQ_USER` / `RABBITMQ_PASS`: credentials (default: guest/guest)
    /// - `RABBITMQ_VHOST`: virtual host (default: `/`)
    /// - `RABBITMQ_MANAGEMENT_PORT`: management API port (default: 15672)
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(host) = env::var("RABBITMQ_HOST").ok().filter(|v| !v.trim().is_empty()) else {
            return Ok(None);
        };
        let mut endpoint = Self {
            host,
            ..Self::default()
        };
        if let Ok(v) = env::var("RABBITMQ_PORT") {
            endpoint.port = v.parse().map_err(|_| ConfigError::InvalidPort("RABBITMQ_PORT", v))?;
        }
        if let Ok(v) = env::var("RABBITMQ_USER") {
            endpoint.user = v;
        }
        if let Ok(v) = env::var("RABBITMQ_PASS") {
            endpoint.password = v;
        }
        if let Ok(v) = env::var("RABBITMQ_VHOST") {
            endpoint.vhost = v;
        }
        if let Ok(v) = env::var("RABBITMQ_MANAGEMENT_PORT") {
            endpoint.management_port = v
                .parse()
                .map_err(|_| ConfigError::InvalidPort("RABBITMQ_MANAGEMENT_PORT", v))?;
        }
        Ok(Some(endpoint))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyBrokerHost);
        }
        if self.vhost.is_empty() {
            return Err(ConfigError::EmptyVhost);
        }
        Ok(())
    }
}

/// Message bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// Name of this service; used in queue names and routing keys
    pub service_name: String,
    /// Topic exchange name
    pub exchange: String,
    /// Base name of the callback queue; a UUID suffix is always appended.
    /// Defaults to `<service_name>_callback`.
    pub callback_queue: Option<String>,
    /// Deadline for a query response
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// How often expired pending queries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Pause after a resource-locked error before cleaning stale queues
    #[serde(with = "humantime_serde")]
    pub lock_recovery_delay: Duration,
    /// Pause after cleanup before reconnecting
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Consecutive transport failures before a publish breaker opens
    pub breaker_failure_threshold: u32,
    /// Recovery timeout of the publish breakers
    #[serde(with = "humantime_serde")]
    pub breaker_recovery_timeout: Duration,
    /// RabbitMQ broker. `None` selects the in-process broker.
    pub broker: Option<BrokerEndpoint>,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            callback_queue: None,
            query_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            lock_recovery_delay: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(1),
            breaker_failure_threshold: 3,
            breaker_recovery_timeout: Duration::from_secs(10),
            broker: None,
        }
    }
}

impl MessageBusConfig {
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Read configuration from the environment.
    ///
    /// - `SERVICE_NAME`: service name (default: service)
    /// - `BUS_EXCHANGE`: exchange name (default: quest_logger)
    /// - `BUS_CALLBACK_QUEUE`: callback queue base name
    /// - `BUS_QUERY_TIMEOUT`: query deadline, e.g. `30s`, `500ms` (default: 30s)
    /// - `RABBITMQ_*`: see [`BrokerEndpoint::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = env::var("SERVICE_NAME") {
            config.service_name = v;
        }
        if let Ok(v) = env::var("BUS_EXCHANGE") {
            config.exchange = v;
        }
        config.callback_queue = env::var("BUS_CALLBACK_QUEUE")
            .ok()
            .filter(|v| !v.trim().is_empty());
        if let Ok(v) = env::var("BUS_QUERY_TIMEOUT") {
            config.query_timeout = humantime_serde::parse_duration(&v)
                .map_err(|_| ConfigError::InvalidDuration("BUS_QUERY_TIMEOUT", v))?;
        }
        config.broker = BrokerEndpoint::from_env()?;

        config.validate()?;
        Ok(config)
    }

    /// Base name of the callback queue before the UUID suffix.
    pub fn callback_base(&self) -> String {
        self.callback_queue
            .clone()
            .unwrap_or_else(|| format!("{}_callback", self.service_name))
    }

    /// Durable queue receiving commands and queries for this service.
    pub fn service_queue(&self) -> String {
        format!("{}_queue", self.service_name)
    }

    /// Durable queue receiving subscribed event patterns.
    pub fn events_queue(&self) -> String {
        format!("{}_events", self.service_name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        if self
            .service_name
            .chars()
            .any(|c| matches!(c, '.' | '*' | '#') || c.is_whitespace())
        {
            return Err(ConfigError::InvalidServiceName(self.service_name.clone()));
        }
        if self.exchange.is_empty() {
            return Err(ConfigError::EmptyExchange);
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigError::ZeroQueryTimeout);
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::ZeroBreakerThreshold);
        }
        if let Some(broker) = &self.broker {
            broker.validate()?;
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("service_name cannot be empty")]
    EmptyServiceName,

    #[error("service_name '{0}' must not contain '.', '*', '#' or whitespace")]
    InvalidServiceName(String),

    #[error("exchange cannot be empty")]
    EmptyExchange,

    #[error("query_timeout must be greater than zero")]
    ZeroQueryTimeout,

    #[error("breaker_failure_threshold must be greater than zero")]
    ZeroBreakerThreshold,

    #[error("invalid duration for {0}: '{1}'")]
    InvalidDuration(&'static str, String),

    #[error("invalid port for {0}: '{1}'")]
    InvalidPort(&'static str, String),

    #[error("broker host cannot be empty")]
    EmptyBrokerHost,

    #[error("broker vhost cannot be empty")]
    EmptyVhost,
}

/// Serde helper for durations written as `"30s"`, `"500ms"` or `"1m"`.
pub mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else {
            // Plain number of seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
