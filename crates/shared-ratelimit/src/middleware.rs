//! Rate limiting middleware for axum routers.
//!
//! Every limited response carries `X-RateLimit-Limit` and
//! `X-RateLimit-Remaining`. Denied requests get a 429 with a JSON body and a
//! `Retry-After` header. If the counter store fails, the request is let
//! through and a warning is logged.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::algorithms::{RateLimitDecision, RateLimiter};
use crate::config::{ConfigError, MiddlewareConfig};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Derives the client identity used in limiter keys.
pub type ClientIdExtractor = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// Shared middleware state
pub struct RateLimitState {
    limiter: RateLimiter,
    config: MiddlewareConfig,
    client_id: ClientIdExtractor,
}

impl fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitState")
            .field("limiter", &self.limiter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimitState {
    pub fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

/// Rate limit layer
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

impl RateLimitLayer {
    /// Build the layer. Every limit in `config` is validated first, so the
    /// request path never sees a zero limit or window.
    pub fn new(limiter: RateLimiter, config: MiddlewareConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(RateLimitState {
                limiter,
                config,
                client_id: Arc::new(default_client_id),
            }),
        })
    }

    /// Replace the client id extractor, e.g. to key on an authenticated user.
    pub fn with_client_id<F>(self, extractor: F) -> Self
    where
        F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
    {
        let state = match Arc::try_unwrap(self.state) {
            Ok(state) => state,
            Err(shared) => RateLimitState {
                limiter: shared.limiter.clone(),
                config: shared.config.clone(),
                client_id: Arc::clone(&shared.client_id),
            },
        };
        Self {
            state: Arc::new(RateLimitState {
                client_id: Arc::new(extractor),
                ..state
            }),
        }
    }

    pub fn state(&self) -> Arc<RateLimitState> {
        Arc::clone(&self.state)
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: Arc::clone(&self.state),
        }
    }
}

/// Rate limit service
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let state = Arc::clone(&self.state);
        // Take the service that was driven to readiness, leave a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let path = req.uri().path().to_string();
            if !state.config.enabled || state.config.is_excluded(&path) {
                return inner.call(req).await;
            }

            let config = *state.config.select(req.method().as_str(), &path);
            let client_id = (state.client_id)(&req);
            let key = limiter_key(&client_id, &path);

            let decision = match state.limiter.check(&key, &config).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(error = %e, client_id = %client_id, path = %path, "Rate limit store unavailable, allowing request");
                    RateLimitDecision {
                        allowed: true,
                        remaining: config.limit,
                        retry_after: 0,
                    }
                }
            };

            let mut response = if decision.allowed {
                inner.call(req).await?
            } else {
                warn!(
                    client_id = %client_id,
                    path = %path,
                    strategy = %config.strategy,
                    retry_after = decision.retry_after,
                    "Rate limit exceeded"
                );
                rate_limit_response(decision.retry_after)
            };

            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(config.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
            if decision.retry_after > 0 {
                headers.insert(
                    axum::http::header::RETRY_AFTER,
                    HeaderValue::from(decision.retry_after),
                );
            }
            debug!(client_id = %client_id, remaining = decision.remaining, "Rate limit headers applied");

            Ok(response)
        })
    }
}

/// First `X-Forwarded-For` entry, else the peer address, else `unknown`.
pub fn default_client_id(req: &Request<Body>) -> String {
    if let Some(first) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return first.to_string();
    }

    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return connect_info.0.ip().to_string();
    }

    "unknown".to_string()
}

/// `client_id:hex(sha256(path))`
pub fn limiter_key(client_id: &str, path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    format!("{}:{}", client_id, hex::encode(digest))
}

fn rate_limit_response(retry_after: u64) -> Response {
    let body = serde_json::json!({
        "error": "Too many requests",
        "detail": "Rate limit exceeded. Please try again later.",
        "retry_after": retry_after,
    });
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}
