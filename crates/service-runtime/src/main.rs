//! # Service Runtime
//!
//! Entry point for a platform service process.
//!
//! ## Startup Sequence
//!
//! 1. Load `RuntimeConfig` from the environment
//! 2. Initialize logging
//! 3. Build breakers, counter store, rate limiter and bus connection
//!    (RabbitMQ when `RABBITMQ_HOST` is set, else in-process)
//! 4. Serve `/health` and `/status/*` until Ctrl-C
//! 5. Close the bus connection

use anyhow::{Context, Result};
use platform_telemetry::init_logging;
use service_runtime::{RuntimeConfig, ServiceRuntime};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env().context("Failed to load configuration")?;
    init_logging(&config.telemetry).context("Failed to initialize logging")?;

    info!(
        service = %config.bus.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting service runtime"
    );

    let runtime = ServiceRuntime::start(config).await?;
    runtime.serve(shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}
