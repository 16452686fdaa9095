//! Service runtime: builds and owns the shared infrastructure of one process.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use serde::{Deserialize, Serialize};
use shared_bus::cqrs::{query_handler_fn, Contract, CqrsRegistry, Query};
use shared_bus::{
    AmqpConnector, Connector, InMemoryBroker, MessageBusConnection, QueueAdmin, RabbitMqAdmin,
};
use shared_cache::{Clock, SystemClock};
use shared_ratelimit::{RateLimitLayer, RateLimiter};
use shared_resilience::{CircuitBreakerRegistry, CircuitState};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::http::{build_router, AppState};

/// Asks a service for its version and open breakers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatusQuery {}

impl Contract for ServiceStatusQuery {
    const NAME: &'static str = "ServiceStatusQuery";
}

impl Query for ServiceStatusQuery {
    type Output = ServiceStatus;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub version: String,
    pub open_breakers: Vec<String>,
}

/// Everything a service process shares between its handlers.
pub struct ServiceRuntime {
    config: RuntimeConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    /// Set when running on the in-process broker
    broker: Option<InMemoryBroker>,
    connection: MessageBusConnection,
    cqrs: CqrsRegistry,
    limiter: RateLimiter,
    rate_limit: RateLimitLayer,
    purge: JoinHandle<()>,
}

impl Drop for ServiceRuntime {
    fn drop(&mut self) {
        self.purge.abort();
    }
}

impl ServiceRuntime {
    /// Start on the RabbitMQ broker in `config.bus.broker`, or on a fresh
    /// in-process broker when none is configured.
    pub async fn start(config: RuntimeConfig) -> Result<Self> {
        match config.bus.broker.clone() {
            Some(endpoint) => {
                let admin = RabbitMqAdmin::new(&endpoint)
                    .context("Invalid RabbitMQ management endpoint")?;
                let connector = AmqpConnector::new(endpoint);
                Self::start_on(config, &connector, &admin, None).await
            }
            None => Self::start_with_broker(config, InMemoryBroker::new()).await,
        }
    }

    /// Start against an existing in-process broker, e.g. one shared with
    /// other services. `config.bus.broker` is ignored.
    pub async fn start_with_broker(config: RuntimeConfig, broker: InMemoryBroker) -> Result<Self> {
        Self::start_on(config, &broker, &broker, Some(broker.clone())).await
    }

    async fn start_on(
        config: RuntimeConfig,
        connector: &dyn Connector,
        admin: &dyn QueueAdmin,
        broker: Option<InMemoryBroker>,
    ) -> Result<Self> {
        config.validate().context("Invalid runtime configuration")?;

        let breakers = Arc::new(CircuitBreakerRegistry::new());

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = shared_cache::connect(&config.cache, Arc::clone(&clock))
            .await
            .context("Failed to connect counter store")?;
        let limiter = RateLimiter::new(store, clock);
        let rate_limit = RateLimitLayer::new(limiter.clone(), config.rate_limit.clone())
            .context("Invalid rate limit configuration")?;

        let connection = MessageBusConnection::connect_with_recovery(
            connector,
            admin,
            config.bus.clone(),
            Arc::clone(&breakers),
        )
        .await
        .context("Failed to connect message bus")?;

        let cqrs = CqrsRegistry::new(Some(connection.clone()), Arc::clone(&breakers));
        register_status_query(&cqrs, &config.bus.service_name, Arc::clone(&breakers));

        let purge = tokio::spawn(shared_cache::purge_task(
            limiter.store().clone(),
            config.cache.purge_interval(),
        ));

        info!(
            service = %config.bus.service_name,
            callback_queue = %connection.callback_queue(),
            broker = if broker.is_some() { "memory" } else { "amqp" },
            rate_limiting = config.rate_limit.enabled,
            redis = config.cache.url.is_some(),
            "Service runtime started"
        );

        Ok(Self {
            config,
            breakers,
            broker,
            connection,
            cqrs,
            limiter,
            rate_limit,
            purge,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The in-process broker, if the runtime is not on RabbitMQ.
    pub fn broker(&self) -> Option<&InMemoryBroker> {
        self.broker.as_ref()
    }

    pub fn connection(&self) -> &MessageBusConnection {
        &self.connection
    }

    pub fn cqrs(&self) -> &CqrsRegistry {
        &self.cqrs
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// HTTP router with the rate-limit layer applied.
    pub fn router(&self) -> Router {
        let state = AppState {
            service_name: self.config.bus.service_name.clone(),
            breakers: Arc::clone(&self.breakers),
            connection: self.connection.clone(),
            broker: self.broker.clone(),
        };
        build_router(state, self.rate_limit.clone())
    }

    /// Serve HTTP until `shutdown` resolves, then close the connection.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.http_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.http_addr))?;
        info!(addr = %self.config.http_addr, "HTTP server listening");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

        self.shutdown().await
    }

    /// Stop the expired-key sweep and close the bus connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.purge.abort();
        self.connection
            .close()
            .await
            .context("Failed to close message bus connection")?;
        info!(service = %self.config.bus.service_name, "Service runtime stopped");
        Ok(())
    }
}

fn register_status_query(
    cqrs: &CqrsRegistry,
    service_name: &str,
    breakers: Arc<CircuitBreakerRegistry>,
) {
    let service = service_name.to_string();
    cqrs.query_bus()
        .register(query_handler_fn(move |_: ServiceStatusQuery| {
            let open_breakers = breakers
                .stats()
                .into_iter()
                .filter(|s| s.state == CircuitState::Open)
                .map(|s| s.name)
                .collect();
            let status = ServiceStatus {
                service: service.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                open_breakers,
            };
            async move { Ok(status) }
        }));
}
