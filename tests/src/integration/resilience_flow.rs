//! # Resilience Flow
//!
//! Broker outages, query deadlines and breaker recovery across the bus and
//! the CQRS layer sharing one breaker registry.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use shared_bus::cqrs::{command_handler_fn, Command, Contract, COMMAND_BUS_BREAKER};
    use shared_bus::{
        BusError, CommandBus, InMemoryBroker, MessageBusConfig, MessageBusConnection,
        SEND_QUERY_BREAKER,
    };
    use shared_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AwardXp {
        amount: u64,
    }

    impl Contract for AwardXp {
        const NAME: &'static str = "AwardXpCommand";
    }

    impl Command for AwardXp {
        type Output = u64;
    }

    async fn connect(
        broker: &InMemoryBroker,
        name: &str,
        breakers: &Arc<CircuitBreakerRegistry>,
    ) -> MessageBusConnection {
        let mut config = MessageBusConfig::for_service(name);
        config.query_timeout = Duration::from_millis(100);
        MessageBusConnection::connect(broker, config, Arc::clone(breakers))
            .await
            .unwrap()
    }

    /// Outage opens the query breaker; once open no query reaches the
    /// transport. A registry reset plus a healthy broker restores service.
    #[tokio::test]
    async fn test_outage_opens_breaker_and_reset_recovers() {
        let broker = InMemoryBroker::new();
        let breakers = Arc::new(CircuitBreakerRegistry::new());

        let users = connect(&broker, "users", &breakers).await;
        users.register_query(
            "GetUserQuery",
            shared_bus::connection::query_handler(|data| async move { Ok(json!({"echo": data})) }),
        );
        let gateway = connect(&broker, "gateway", &breakers).await;

        broker.set_available(false);
        for _ in 0..3 {
            let err = gateway
                .send_query("users", "GetUserQuery", json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, BusError::Transport(_)));
        }
        let breaker = breakers.get(SEND_QUERY_BREAKER).unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);

        broker.set_available(true);
        let published = broker.stats().published;
        let short_circuited = gateway
            .send_query("users", "GetUserQuery", json!({}))
            .await
            .unwrap();
        assert_eq!(short_circuited, None);
        assert_eq!(broker.stats().published, published);

        assert!(breakers.reset(SEND_QUERY_BREAKER));
        let response = gateway
            .send_query("users", "GetUserQuery", json!({"id": 1}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, json!({"echo": {"id": 1}}));
        assert_eq!(gateway.pending_count(), 0);
    }

    /// Unanswered queries are evicted at their deadline and count against
    /// the breaker.
    #[tokio::test]
    async fn test_query_timeout_evicts_and_counts_as_failure() {
        let broker = InMemoryBroker::new();
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let gateway = connect(&broker, "gateway", &breakers).await;

        let err = gateway
            .send_query("ghost", "GetUserQuery", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::QueryTimeout { .. }));
        assert_eq!(gateway.pending_count(), 0);
        assert_eq!(gateway.pending_stats().total_timeouts, 1);

        let stats = breakers.get(SEND_QUERY_BREAKER).unwrap().stats();
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.state, CircuitState::Closed);
    }

    /// Handler failures stay failure results; the command bus breaker only
    /// opens through the shared registry, and commands then get the fallback
    /// result until it is reset.
    #[tokio::test]
    async fn test_command_bus_fallback_until_reset() {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let bus = CommandBus::new(None, Arc::clone(&breakers));
        bus.register(command_handler_fn(|cmd: AwardXp| async move {
            if cmd.amount == 0 {
                anyhow::bail!("amount must be positive");
            }
            Ok(cmd.amount)
        }));

        for _ in 0..5 {
            let rejected = bus.execute(AwardXp { amount: 0 }).await;
            assert!(!rejected.success);
            assert_eq!(rejected.errors, vec!["amount must be positive".to_string()]);
        }
        assert!(bus.execute(AwardXp { amount: 3 }).await.success);

        let breaker = breakers.get_or_create(
            COMMAND_BUS_BREAKER,
            CircuitBreakerConfig::new(5, Duration::from_secs(30)),
        );
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let fallback = bus.execute(AwardXp { amount: 10 }).await;
        assert!(!fallback.success);
        assert_eq!(
            fallback.message.as_deref(),
            Some("Service temporarily unavailable")
        );

        breakers.reset(COMMAND_BUS_BREAKER);
        let result = bus.execute(AwardXp { amount: 10 }).await;
        assert!(result.success);
        assert_eq!(result.data, Some(10));
    }

    /// A remote command whose handler fails is dead-lettered, not retried.
    #[tokio::test]
    async fn test_failed_remote_command_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let breakers = Arc::new(CircuitBreakerRegistry::new());

        let quests = CommandBus::new(
            Some(connect(&broker, "quests", &breakers).await),
            Arc::clone(&breakers),
        );
        quests.register(command_handler_fn(|_: AwardXp| async move {
            anyhow::bail!("ledger unavailable")
        }));

        let gateway =
            CommandBus::new(Some(connect(&broker, "gateway", &breakers).await), breakers);
        assert_eq!(
            gateway.send_remote("quests", &AwardXp { amount: 5 }).await.unwrap(),
            Some(())
        );

        for _ in 0..200 {
            if !broker.dead_letters().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.queue_depth("quests_queue"), Some(0));
    }
}
