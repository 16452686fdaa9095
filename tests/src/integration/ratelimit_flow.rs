//! # Rate Limit Flow
//!
//! Middleware config precedence and the three algorithms over simulated
//! time, all against one shared counter store.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::{get, post};
    use axum::Router;
    use tower::ServiceExt;

    use shared_cache::{CounterStoreClient, ManualClock, MemoryBackend};
    use shared_ratelimit::{
        MiddlewareConfig, RateLimitConfig, RateLimitLayer, RateLimitStrategy, RateLimiter,
    };

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = CounterStoreClient::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            "ratelimit:",
        );
        (RateLimiter::new(store, clock.clone()), clock)
    }

    fn app(limiter: RateLimiter, config: MiddlewareConfig) -> Router {
        Router::new()
            .route("/api/login", post(|| async { "ok" }))
            .route("/api/quests", get(|| async { "ok" }).post(|| async { "ok" }))
            .route("/api/profile", get(|| async { "ok" }))
            .route("/health", get(|| async { "ok" }))
            .layer(
                RateLimitLayer::new(limiter, config)
                    .unwrap()
                    .with_client_id(|req| {
                        req.headers()
                            .get("x-user")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("anonymous")
                            .to_string()
                    }),
            )
    }

    async fn call(app: &Router, method: &str, path: &str, user: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("x-user", user)
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    /// Endpoint limits beat method limits, which beat the default. Counters
    /// are per client and path, not per method.
    #[tokio::test]
    async fn test_config_precedence_and_client_isolation() {
        let (limiter, _) = limiter();
        let config = MiddlewareConfig {
            default: RateLimitConfig::new(5, 60, RateLimitStrategy::FixedWindow),
            ..MiddlewareConfig::default()
        }
        .with_method("POST", RateLimitConfig::new(2, 60, RateLimitStrategy::FixedWindow))
        .with_endpoint(
            "/api/login",
            RateLimitConfig::new(1, 60, RateLimitStrategy::FixedWindow),
        );
        let app = app(limiter, config);

        // Endpoint: 1 per window
        assert_eq!(call(&app, "POST", "/api/login", "ada").await, StatusCode::OK);
        assert_eq!(
            call(&app, "POST", "/api/login", "ada").await,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(call(&app, "POST", "/api/login", "bob").await, StatusCode::OK);

        // Method: 2 per window
        for _ in 0..2 {
            assert_eq!(call(&app, "POST", "/api/quests", "ada").await, StatusCode::OK);
        }
        assert_eq!(
            call(&app, "POST", "/api/quests", "ada").await,
            StatusCode::TOO_MANY_REQUESTS
        );

        // Default: 5 per window
        for _ in 0..5 {
            assert_eq!(call(&app, "GET", "/api/profile", "ada").await, StatusCode::OK);
        }
        assert_eq!(
            call(&app, "GET", "/api/profile", "ada").await,
            StatusCode::TOO_MANY_REQUESTS
        );

        // Excluded
        for _ in 0..10 {
            assert_eq!(call(&app, "GET", "/health", "ada").await, StatusCode::OK);
        }
    }

    /// A denied client is admitted again once its window has passed.
    #[tokio::test]
    async fn test_fixed_window_recovers_after_window() {
        let (limiter, clock) = limiter();
        let config = MiddlewareConfig {
            default: RateLimitConfig::new(1, 30, RateLimitStrategy::FixedWindow),
            ..MiddlewareConfig::default()
        };
        let app = app(limiter, config);

        assert_eq!(call(&app, "GET", "/api/quests", "ada").await, StatusCode::OK);
        assert_eq!(
            call(&app, "GET", "/api/quests", "ada").await,
            StatusCode::TOO_MANY_REQUESTS
        );

        clock.advance(Duration::from_secs(30));
        assert_eq!(call(&app, "GET", "/api/quests", "ada").await, StatusCode::OK);
    }

    /// Token bucket: a full burst, denial, then one token per
    /// `window / limit` seconds.
    #[tokio::test]
    async fn test_token_bucket_refills_over_time() {
        let (limiter, clock) = limiter();
        let config = RateLimitConfig::new(4, 8, RateLimitStrategy::TokenBucket);

        for _ in 0..4 {
            assert!(limiter.check("bucket:ada", &config).await.unwrap().allowed);
        }
        let denied = limiter.check("bucket:ada", &config).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after >= 1);

        clock.advance(Duration::from_secs(2));
        assert!(limiter.check("bucket:ada", &config).await.unwrap().allowed);
        assert!(!limiter.check("bucket:ada", &config).await.unwrap().allowed);
    }

    /// Sliding window: old buckets fall out of the window one at a time.
    #[tokio::test]
    async fn test_sliding_window_forgets_old_buckets() {
        let (limiter, clock) = limiter();
        let config =
            RateLimitConfig::new(4, 60, RateLimitStrategy::SlidingWindow).with_bucket_count(6);

        for _ in 0..4 {
            assert!(limiter.check("slide:ada", &config).await.unwrap().allowed);
        }
        assert!(!limiter.check("slide:ada", &config).await.unwrap().allowed);

        // Still inside the window
        clock.advance(Duration::from_secs(30));
        assert!(!limiter.check("slide:ada", &config).await.unwrap().allowed);

        // The first bucket has aged out
        clock.advance(Duration::from_secs(40));
        assert!(limiter.check("slide:ada", &config).await.unwrap().allowed);
    }
}
