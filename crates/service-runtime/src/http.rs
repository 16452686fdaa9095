//! HTTP surface: health and status endpoints behind the rate-limit layer.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use shared_bus::{InMemoryBroker, MessageBusConnection};
use shared_ratelimit::RateLimitLayer;
use shared_resilience::CircuitBreakerRegistry;

/// State shared by the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub connection: MessageBusConnection,
    /// Present when running on the in-process broker
    pub broker: Option<InMemoryBroker>,
}

pub fn build_router(state: AppState, rate_limit: RateLimitLayer) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status/breakers", get(breaker_status))
        .route("/status/bus", get(bus_status))
        .with_state(state)
        .layer(rate_limit)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (code, status) = if state.connection.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    } else {
        (StatusCode::OK, "healthy")
    };
    (
        code,
        Json(json!({
            "status": status,
            "service": state.service_name,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn breaker_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "breakers": state.breakers.stats() }))
}

async fn bus_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "callback_queue": state.connection.callback_queue(),
        "pending": state.connection.pending_stats(),
        "broker": state.broker.as_ref().map(InMemoryBroker::stats),
    }))
}
