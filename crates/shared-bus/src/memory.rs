//! In-process topic broker.
//!
//! Implements [`Connector`], [`Transport`] and [`QueueAdmin`] with the
//! semantics the connection relies on:
//!
//! - exclusive queues refuse other connections with `ResourceLocked`
//! - auto-delete queues disappear with their last consumer
//! - closing a connection drops its exclusive queues and ends its consumers
//! - unsettled deliveries are requeued when dropped, rejected ones without
//!   requeue are dead-lettered; only the newest [`DEFAULT_DEAD_LETTER_CAPACITY`]
//!   dead letters are kept

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::topic;
use crate::transport::{
    Acker, Connector, Consumer, Delivery, Envelope, QueueAdmin, QueueOptions, Transport,
};

/// Dead letters retained before the oldest are dropped.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1_000;

/// Broker counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub published: u64,
    pub acked: u64,
    pub dead_lettered: u64,
    pub queues: usize,
}

struct ConsumerSlot {
    id: u64,
    connection: u64,
    notify: Arc<Notify>,
}

struct QueueState {
    /// Distinguishes a re-declared queue from a deleted one of the same name
    id: u64,
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
}

impl QueueState {
    fn push(&mut self, envelope: Envelope) {
        self.messages.push_back(envelope);
        self.wake();
    }

    fn wake(&self) {
        for slot in &self.consumers {
            slot.notify.notify_one();
        }
    }
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    dead_letters: VecDeque<Envelope>,
}

impl BrokerState {
    fn remove_queue(&mut self, name: &str) -> bool {
        match self.queues.remove(name) {
            Some(queue) => {
                self.bindings.retain(|b| b.queue != name);
                queue.wake();
                true
            }
            None => false,
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    available: AtomicBool,
    published: AtomicU64,
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_capacity: usize,
}

impl BrokerInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("broker is down".to_string()))
        }
    }

    fn requeue(&self, queue: &str, queue_id: u64, envelope: Envelope) {
        let mut state = self.state.lock();
        match state.queues.get_mut(queue) {
            Some(q) if q.id == queue_id => {
                q.messages.push_front(envelope);
                q.wake();
            }
            _ => debug!(queue = queue, "Queue gone, dropping requeued message"),
        }
    }

    fn dead_letter(&self, envelope: Envelope) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if self.dead_letter_capacity == 0 {
            return;
        }
        let mut state = self.state.lock();
        while state.dead_letters.len() >= self.dead_letter_capacity {
            state.dead_letters.pop_front();
        }
        state.dead_letters.push_back(envelope);
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_dead_letter_capacity(DEFAULT_DEAD_LETTER_CAPACITY)
    }

    /// Broker keeping at most `capacity` dead letters, dropping the oldest.
    pub fn with_dead_letter_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                next_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
                published: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
                dead_letter_capacity: capacity,
            }),
        }
    }

    /// Open a connection with its concrete type.
    pub fn open(&self) -> Result<MemoryTransport, TransportError> {
        self.inner.check_available()?;
        let id = self.inner.next_id();
        debug!(connection = id, "In-memory broker connection opened");
        Ok(MemoryTransport {
            broker: Arc::clone(&self.inner),
            id,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Simulate an outage: connects, declarations and publishes fail.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
        if available {
            info!("In-memory broker available");
        } else {
            warn!("In-memory broker marked unavailable");
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ready messages in a queue.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.messages.len())
    }

    pub fn dead_letters(&self) -> Vec<Envelope> {
        self.inner.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.inner.published.load(Ordering::Relaxed),
            acked: self.inner.acked.load(Ordering::Relaxed),
            dead_lettered: self.inner.dead_lettered.load(Ordering::Relaxed),
            queues: self.inner.state.lock().queues.len(),
        }
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(self.open()?))
    }
}

#[async_trait]
impl QueueAdmin for InMemoryBroker {
    async fn list_queues(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.queue_names())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        if self.inner.state.lock().remove_queue(name) {
            info!(queue = name, "Queue deleted via management interface");
            Ok(())
        } else {
            Err(TransportError::QueueNotFound(name.to_string()))
        }
    }
}

/// One connection to an [`InMemoryBroker`].
pub struct MemoryTransport {
    broker: Arc<BrokerInner>,
    id: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.broker.check_available()
    }

    fn locked_by_other(&self, queue: &QueueState) -> bool {
        queue.owner.is_some_and(|owner| owner != self.id)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, name: &str) -> Result<(), TransportError> {
        self.check_open()?;
        self.broker.state.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.broker.state.lock();
        if let Some(existing) = state.queues.get(name) {
            let claimed = options.exclusive
                && existing.owner != Some(self.id)
                && !existing.consumers.is_empty();
            if self.locked_by_other(existing) || claimed {
                return Err(TransportError::ResourceLocked(name.to_string()));
            }
            return Ok(());
        }

        let id = self.broker.next_id();
        state.queues.insert(
            name.to_string(),
            QueueState {
                id,
                options,
                owner: options.exclusive.then_some(self.id),
                messages: VecDeque::new(),
                consumers: Vec::new(),
            },
        );
        debug!(queue = name, connection = self.id, ?options, "Queue declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::ExchangeNotFound(exchange.to_string()));
        }
        match state.queues.get(queue) {
            None => return Err(TransportError::QueueNotFound(queue.to_string())),
            Some(q) if self.locked_by_other(q) => {
                return Err(TransportError::ResourceLocked(queue.to_string()))
            }
            Some(_) => {}
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mut envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        envelope.routing_key = routing_key.to_string();

        let mut state = self.broker.state.lock();
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::ExchangeNotFound(exchange.to_string()));
        }

        let mut targets: Vec<String> = Vec::new();
        for binding in &state.bindings {
            if binding.exchange == exchange
                && topic::matches(&binding.pattern, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        self.broker.published.fetch_add(1, Ordering::Relaxed);
        if targets.is_empty() {
            debug!(exchange = exchange, routing_key = routing_key, "Unroutable message dropped");
            return Ok(());
        }

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.push(envelope.clone());
            }
        }
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, mut envelope: Envelope) -> Result<(), TransportError> {
        self.check_open()?;
        envelope.routing_key = queue.to_string();
        let mut state = self.broker.state.lock();
        match state.queues.get_mut(queue) {
            Some(q) => {
                self.broker.published.fetch_add(1, Ordering::Relaxed);
                q.push(envelope);
                Ok(())
            }
            None => Err(TransportError::QueueNotFound(queue.to_string())),
        }
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, TransportError> {
        self.check_open()?;
        let mut state = self.broker.state.lock();
        let q = match state.queues.get_mut(queue) {
            Some(q) => q,
            None => return Err(TransportError::QueueNotFound(queue.to_string())),
        };
        if self.locked_by_other(q) {
            return Err(TransportError::ResourceLocked(queue.to_string()));
        }

        let notify = Arc::new(Notify::new());
        let slot_id = self.broker.next_id();
        q.consumers.push(ConsumerSlot {
            id: slot_id,
            connection: self.id,
            notify: Arc::clone(&notify),
        });
        // Pick up anything already waiting.
        if !q.messages.is_empty() {
            notify.notify_one();
        }

        Ok(Box::new(MemoryConsumer {
            broker: Arc::clone(&self.broker),
            queue: queue.to_string(),
            queue_id: q.id,
            slot_id,
            notify,
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.broker.state.lock();
        match state.queues.get(name) {
            None => return Err(TransportError::QueueNotFound(name.to_string())),
            Some(q) if self.locked_by_other(q) => {
                return Err(TransportError::ResourceLocked(name.to_string()))
            }
            Some(_) => {}
        }
        state.remove_queue(name);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.broker.state.lock();
        let doomed: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| {
                q.owner == Some(self.id)
                    || (q.options.auto_delete
                        && !q.consumers.is_empty()
                        && q.consumers.iter().all(|c| c.connection == self.id))
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            state.remove_queue(name);
        }

        for queue in state.queues.values_mut() {
            let (mine, others): (Vec<_>, Vec<_>) = queue
                .consumers
                .drain(..)
                .partition(|c| c.connection == self.id);
            for slot in mine {
                slot.notify.notify_one();
            }
            queue.consumers = others;
        }

        debug!(connection = self.id, removed = doomed.len(), "In-memory broker connection closed");
        Ok(())
    }
}

struct MemoryConsumer {
    broker: Arc<BrokerInner>,
    queue: String,
    queue_id: u64,
    slot_id: u64,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            {
                let mut state = self.broker.state.lock();
                let queue = match state.queues.get_mut(&self.queue) {
                    Some(q) if q.id == self.queue_id => q,
                    _ => return None,
                };
                if let Some(envelope) = queue.messages.pop_front() {
                    let acker = MemoryAcker {
                        broker: Arc::clone(&self.broker),
                        queue: self.queue.clone(),
                        queue_id: self.queue_id,
                        envelope: Mutex::new(Some(envelope.clone())),
                    };
                    return Some(Delivery::new(envelope, Box::new(acker)));
                }
            }
            self.notify.notified().await;
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let mut state = self.broker.state.lock();
        let emptied = match state.queues.get_mut(&self.queue) {
            Some(q) if q.id == self.queue_id => {
                q.consumers.retain(|c| c.id != self.slot_id);
                q.options.auto_delete && q.consumers.is_empty()
            }
            _ => false,
        };
        if emptied {
            state.remove_queue(&self.queue);
            debug!(queue = %self.queue, "Auto-delete queue removed with its last consumer");
        }
    }
}

struct MemoryAcker {
    broker: Arc<BrokerInner>,
    queue: String,
    queue_id: u64,
    /// `None` once settled
    envelope: Mutex<Option<Envelope>>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        if self.envelope.lock().take().is_some() {
            self.broker.acked.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        let envelope = self.envelope.lock().take();
        if let Some(envelope) = envelope {
            if requeue {
                self.broker.requeue(&self.queue, self.queue_id, envelope);
            } else {
                self.broker.dead_letter(envelope);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(envelope) = self.envelope.get_mut().take() {
            self.broker.requeue(&self.queue, self.queue_id, envelope);
        }
    }
}
