//! Pending queries awaiting a response on the callback queue.
//!
//! Maps correlation IDs to the caller waiting in `send_query`. Entries leave
//! the map exactly once: completed by a response, evicted on timeout,
//! cancelled by the caller or failed when the connection closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::correlation::CorrelationId;
use crate::error::BusError;

/// Outcome delivered to a waiting query.
pub type QueryOutcome = Result<Value, BusError>;

struct PendingQuery {
    sender: oneshot::Sender<QueryOutcome>,
    created_at: Instant,
    name: String,
    timeout: Duration,
}

/// Counters for the pending query table
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_timeouts: AtomicU64,
    pub total_cancelled: AtomicU64,
}

/// Point-in-time copy of [`PendingStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingSnapshot {
    pub pending: usize,
    pub total_registered: u64,
    pub total_completed: u64,
    pub total_timeouts: u64,
    pub total_cancelled: u64,
}

/// Correlation table for in-flight queries.
pub struct PendingQueries {
    pending: DashMap<CorrelationId, PendingQuery>,
    default_timeout: Duration,
    stats: PendingStats,
}

impl PendingQueries {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            default_timeout,
            stats: PendingStats::default(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a query and get the receiver for its outcome.
    pub fn register(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> (CorrelationId, oneshot::Receiver<QueryOutcome>) {
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            correlation_id,
            PendingQuery {
                sender: tx,
                created_at: Instant::now(),
                name: name.to_string(),
                timeout: timeout.unwrap_or(self.default_timeout),
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        debug!(correlation_id = %correlation_id, query = name, "Registered pending query");
        (correlation_id, rx)
    }

    /// Resolve a pending query with its response data.
    ///
    /// Returns false for unknown or already-resolved correlation IDs.
    pub fn complete(&self, correlation_id: CorrelationId, data: Value) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            warn!(
                correlation_id = %correlation_id,
                "Response for unknown or expired correlation ID"
            );
            return false;
        };

        let elapsed = pending.created_at.elapsed();
        if pending.sender.send(Ok(data)).is_ok() {
            self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                query = pending.name,
                response_time_ms = elapsed.as_millis(),
                "Completed pending query"
            );
            true
        } else {
            // Caller already gave up
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Drop a pending query whose caller stopped waiting.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Evict a query whose deadline passed in the caller.
    pub fn expire(&self, correlation_id: &CorrelationId) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Evict every query older than its timeout, failing its waiter.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| now.duration_since(entry.created_at) > entry.timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, pending)) = self.pending.remove(&id) {
                warn!(
                    correlation_id = %id,
                    query = pending.name,
                    timeout_ms = pending.timeout.as_millis(),
                    "Removing expired pending query"
                );
                let _ = pending.sender.send(Err(BusError::QueryTimeout {
                    name: pending.name,
                    timeout: pending.timeout,
                }));
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                removed += 1;
            }
        }
        removed
    }

    /// Fail every waiter with `ConnectionClosed`.
    pub fn fail_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.sender.send(Err(BusError::ConnectionClosed));
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                failed += 1;
            }
        }
        failed
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            pending: self.pending.len(),
            total_registered: self.stats.total_registered.load(Ordering::Relaxed),
            total_completed: self.stats.total_completed.load(Ordering::Relaxed),
            total_timeouts: self.stats.total_timeouts.load(Ordering::Relaxed),
            total_cancelled: self.stats.total_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Background sweep of expired queries.
pub async fn cleanup_task(store: Arc<PendingQueries>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let removed = store.remove_expired();
        if removed > 0 {
            debug!(removed = removed, "Swept expired pending queries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_complete() {
        let store = PendingQueries::new(Duration::from_secs(30));

        let (id, rx) = store.register("GetUserQuery", None);
        assert!(store.is_pending(&id));

        assert!(store.complete(id, json!({"id": 1})));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"id": 1}));
        assert_eq!(store.pending_count(), 0);

        // Exactly once
        assert!(!store.complete(id, json!(null)));
    }

    #[tokio::test]
    async fn test_remove_expired_fails_waiter() {
        let store = PendingQueries::new(Duration::from_millis(10));
        let (id, rx) = store.register("GetUserQuery", None);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.remove_expired(), 1);
        assert!(!store.is_pending(&id));

        match rx.await.unwrap() {
            Err(BusError::QueryTimeout { name, .. }) => assert_eq!(name, "GetUserQuery"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.snapshot().total_timeouts, 1);
    }

    #[tokio::test]
    async fn test_custom_timeout_outlives_default() {
        let store = PendingQueries::new(Duration::from_millis(5));
        let (long, _rx1) = store.register("Slow", Some(Duration::from_secs(60)));
        let (_short, _rx2) = store.register("Fast", None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.remove_expired(), 1);
        assert!(store.is_pending(&long));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let store = PendingQueries::new(Duration::from_secs(30));
        let (_a, rx_a) = store.register("A", None);
        let (_b, rx_b) = store.register("B", None);

        assert_eq!(store.fail_all(), 2);
        assert!(matches!(rx_a.await.unwrap(), Err(BusError::ConnectionClosed)));
        assert!(matches!(rx_b.await.unwrap(), Err(BusError::ConnectionClosed)));
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_after_caller_dropped() {
        let store = PendingQueries::new(Duration::from_secs(30));
        let (id, rx) = store.register("A", None);
        drop(rx);

        assert!(!store.complete(id, json!(1)));
        assert_eq!(store.snapshot().total_cancelled, 1);
    }

    #[test]
    fn test_cancel_and_expire() {
        let store = PendingQueries::new(Duration::from_secs(30));
        let (a, _rx_a) = store.register("A", None);
        let (b, _rx_b) = store.register("B", None);

        assert!(store.cancel(&a));
        assert!(!store.cancel(&a));
        assert!(store.expire(&b));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.total_registered, 2);
        assert_eq!(snapshot.total_cancelled, 1);
        assert_eq!(snapshot.total_timeouts, 1);
        assert_eq!(snapshot.pending, 0);
    }
}
