//! # Gateway Flow
//!
//! An HTTP gateway fronting two services over one broker:
//!
//! 1. **GET /users/:id**: rate-limited route answered by a remote query to `users`
//! 2. **POST /users**: command sent to `users`, which publishes `UserCreatedEvent`
//! 3. **Event fan-out**: `quests` reacts to `UserCreatedEvent` with its own handler

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::extract::{Path, State};
    use axum::http::{Request, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use service_runtime::{RuntimeConfig, ServiceRuntime, ServiceStatusQuery};
    use shared_bus::cqrs::{
        command_handler_fn, event_handler_fn, query_handler_fn, Command, Contract, Event, Query,
    };
    use shared_bus::{CqrsRegistry, InMemoryBroker, MessageBusConfig, MessageBusConnection};
    use shared_cache::{CounterStoreClient, ManualClock, MemoryBackend};
    use shared_ratelimit::{
        MiddlewareConfig, RateLimitConfig, RateLimitLayer, RateLimitStrategy, RateLimiter,
    };
    use shared_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};

    // =============================================================================
    // CONTRACTS
    // =============================================================================

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GetUser {
        user_id: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserView {
        id: u64,
        email: String,
    }

    impl Contract for GetUser {
        const NAME: &'static str = "GetUserQuery";
    }

    impl Query for GetUser {
        type Output = UserView;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CreateUser {
        email: String,
    }

    impl Contract for CreateUser {
        const NAME: &'static str = "CreateUserCommand";
    }

    impl Command for CreateUser {
        type Output = u64;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct UserCreated {
        user_id: u64,
        email: String,
    }

    impl Contract for UserCreated {
        const NAME: &'static str = "UserCreatedEvent";
    }

    impl Event for UserCreated {}

    // =============================================================================
    // FIXTURES
    // =============================================================================

    /// Collects values from handlers running on other tasks.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn push(&self, value: String) {
            self.0.lock().push(value);
        }

        fn values(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    async fn service(broker: &InMemoryBroker, name: &str) -> CqrsRegistry {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let connection = MessageBusConnection::connect(
            broker,
            MessageBusConfig::for_service(name),
            Arc::clone(&breakers),
        )
        .await
        .unwrap();
        CqrsRegistry::new(Some(connection), breakers)
    }

    /// `users` answers `GetUserQuery` and handles `CreateUserCommand` by
    /// publishing `UserCreatedEvent`.
    async fn users_service(broker: &InMemoryBroker) -> CqrsRegistry {
        let users = service(broker, "users").await;

        users
            .query_bus()
            .register(query_handler_fn(|q: GetUser| async move {
                if q.user_id == 0 {
                    anyhow::bail!("user {} not found", q.user_id);
                }
                Ok(UserView {
                    id: q.user_id,
                    email: format!("user{}@quest.dev", q.user_id),
                })
            }));

        let events = users.event_bus().clone();
        users
            .command_bus()
            .register(command_handler_fn(move |cmd: CreateUser| {
                let events = events.clone();
                async move {
                    let user_id = cmd.email.len() as u64;
                    events
                        .publish(UserCreated {
                            user_id,
                            email: cmd.email,
                        })
                        .await;
                    Ok(user_id)
                }
            }));

        users
    }

    fn limited(limit: u64) -> RateLimitLayer {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = CounterStoreClient::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            "ratelimit:",
        );
        let config = MiddlewareConfig {
            default: RateLimitConfig::new(limit, 60, RateLimitStrategy::FixedWindow),
            ..MiddlewareConfig::default()
        };
        RateLimitLayer::new(RateLimiter::new(store, clock), config).unwrap()
    }

    fn gateway_router(gateway: CqrsRegistry, limit: u64) -> Router {
        async fn get_user(
            State(bus): State<CqrsRegistry>,
            Path(id): Path<u64>,
        ) -> (StatusCode, Json<Value>) {
            match bus.query_bus().query_remote("users", &GetUser { user_id: id }).await {
                Ok(Some(result)) if result.success => (StatusCode::OK, Json(json!(result.data))),
                Ok(Some(result)) => (StatusCode::NOT_FOUND, Json(json!(result.errors))),
                Ok(None) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!("circuit open"))),
                Err(e) => (StatusCode::BAD_GATEWAY, Json(json!(e.to_string()))),
            }
        }

        async fn create_user(
            State(bus): State<CqrsRegistry>,
            Json(cmd): Json<CreateUser>,
        ) -> StatusCode {
            match bus.command_bus().send_remote("users", &cmd).await {
                Ok(Some(())) => StatusCode::ACCEPTED,
                Ok(None) => StatusCode::SERVICE_UNAVAILABLE,
                Err(_) => StatusCode::BAD_GATEWAY,
            }
        }

        Router::new()
            .route("/users/:id", get(get_user))
            .route("/users", post(create_user))
            .with_state(gateway)
            .layer(limited(limit))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn eventually(recorder: &Recorder, len: usize) {
        for _ in 0..200 {
            if recorder.values().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // =============================================================================
    // INTEGRATION TESTS
    // =============================================================================

    /// Queries travel HTTP → gateway → users and back; the limiter cuts in
    /// after the configured number of requests.
    #[tokio::test]
    async fn test_rate_limited_query_through_gateway() {
        let broker = InMemoryBroker::new();
        let _users = users_service(&broker).await;
        let app = gateway_router(service(&broker, "gateway").await, 3);

        let request = || Request::get("/users/7").body(Body::empty()).unwrap();

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-remaining"], "2");
        assert_eq!(
            body_json(first).await,
            json!({"id": 7, "email": "user7@quest.dev"})
        );

        for _ in 0..2 {
            let response = app.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let denied = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    /// Handler failures on the remote side become failure results, not
    /// transport errors.
    #[tokio::test]
    async fn test_remote_handler_failure_maps_to_not_found() {
        let broker = InMemoryBroker::new();
        let _users = users_service(&broker).await;
        let app = gateway_router(service(&broker, "gateway").await, 10);

        let response = app
            .oneshot(Request::get("/users/0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await, json!(["user 0 not found"]));
    }

    /// Command from the gateway, event from users, handled by quests.
    #[tokio::test]
    async fn test_command_triggers_event_in_other_service() {
        let broker = InMemoryBroker::new();
        let _users = users_service(&broker).await;

        let quests = service(&broker, "quests").await;
        let recorder = Recorder::default();
        let seen = recorder.clone();
        quests
            .event_bus()
            .register(event_handler_fn(move |event: UserCreated| {
                let seen = seen.clone();
                async move {
                    seen.push(format!("welcome-quest:{}", event.email));
                    Ok(())
                }
            }))
            .await
            .unwrap();

        let app = gateway_router(service(&broker, "gateway").await, 10);
        let response = app
            .oneshot(
                Request::post("/users")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"email":"ada@quest.dev"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        eventually(&recorder, 1).await;
        assert_eq!(recorder.values(), vec!["welcome-quest:ada@quest.dev"]);
        assert_eq!(broker.dead_letters().len(), 0);
    }

    /// A service runtime answers status queries from other services and
    /// reports its open breakers.
    #[tokio::test]
    async fn test_runtime_status_reports_open_breakers() {
        let broker = InMemoryBroker::new();
        let runtime =
            ServiceRuntime::start_with_broker(RuntimeConfig::for_service("quests"), broker.clone())
                .await
                .unwrap();

        let breaker = runtime
            .breakers()
            .get_or_create("quest_store", CircuitBreakerConfig::new(1, Duration::from_secs(60)));
        breaker.record_failure();

        let gateway = service(&broker, "gateway").await;
        let result = gateway
            .query_bus()
            .query_remote("quests", &ServiceStatusQuery::default())
            .await
            .unwrap()
            .unwrap();
        let status = result.data.unwrap();
        assert_eq!(status.service, "quests");
        assert_eq!(status.open_breakers, vec!["quest_store".to_string()]);

        runtime.shutdown().await.unwrap();
    }
}
