//! # Platform Telemetry
//!
//! Structured logging bootstrap shared by every platform service.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use platform_telemetry::{init_logging, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&TelemetryConfig::from_env())?;
//!     tracing::info!("service starting");
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_SERVICE_NAME` | `quest-platform` | Service name in logs |
//! | `PLATFORM_LOG_LEVEL` / `RUST_LOG` | `info` | `EnvFilter` directive |
//! | `PLATFORM_JSON_LOGS` | `false` (`true` in containers) | JSON output |
//! | `PLATFORM_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::{build_filter, init_logging};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Span carrying the service name, entered for the lifetime of a service.
///
/// ```rust,ignore
/// let _span = platform_telemetry::service_span!("quest-service").entered();
/// ```
#[macro_export]
macro_rules! service_span {
    ($service:expr) => {
        tracing::info_span!("service", service = %$service)
    };
    ($service:expr, $($field:tt)*) => {
        tracing::info_span!("service", service = %$service, $($field)*)
    };
}
