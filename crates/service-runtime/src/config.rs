//! Runtime configuration: one struct aggregating every crate's config.

use std::env;
use std::net::SocketAddr;

use platform_telemetry::TelemetryConfig;
use shared_bus::MessageBusConfig;
use shared_cache::{CacheConfig, CacheError};
use shared_ratelimit::MiddlewareConfig;
use thiserror::Error;

/// Default HTTP bind address
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Configuration for a service process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Address the HTTP router binds to
    pub http_addr: SocketAddr,
    pub telemetry: TelemetryConfig,
    pub cache: CacheConfig,
    pub rate_limit: MiddlewareConfig,
    pub bus: MessageBusConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::for_service("service")
    }
}

impl RuntimeConfig {
    /// Defaults for a named service, with the memory counter store.
    pub fn for_service(service_name: &str) -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            telemetry: TelemetryConfig {
                service_name: service_name.to_string(),
                ..TelemetryConfig::default()
            },
            cache: CacheConfig::default(),
            rate_limit: MiddlewareConfig::default(),
            bus: MessageBusConfig::for_service(service_name),
        }
    }

    /// Read every section from the environment.
    ///
    /// - `RUNTIME_HTTP_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
    ///
    /// The log service name falls back to `SERVICE_NAME` when
    /// `OTEL_SERVICE_NAME` is unset. See each crate for its own variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bus = MessageBusConfig::from_env()?;

        let mut telemetry = TelemetryConfig::from_env();
        if env::var("OTEL_SERVICE_NAME").is_err() {
            telemetry.service_name = bus.service_name.clone();
        }

        let addr = env::var("RUNTIME_HTTP_ADDR").unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
        let http_addr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidHttpAddr(addr.clone()))?;

        let config = Self {
            http_addr,
            telemetry,
            cache: CacheConfig::from_env()?,
            rate_limit: MiddlewareConfig::from_env()?,
            bus,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.log_level.trim().is_empty() {
            return Err(ConfigError::EmptyLogLevel);
        }
        self.bus.validate()?;
        self.cache.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid HTTP address '{0}'")]
    InvalidHttpAddr(String),

    #[error("log level cannot be empty")]
    EmptyLogLevel,

    #[error("message bus: {0}")]
    Bus(#[from] shared_bus::ConfigError),

    #[error("counter store: {0}")]
    Cache(#[from] CacheError),

    #[error("rate limit: {0}")]
    RateLimit(#[from] shared_ratelimit::ConfigError),
}
