//! # In-Memory Broker
//!
//! In-process [`MessageBroker`] for tests and development. It models the parts
//! of AMQP the dispatch pipeline relies on:
//!
//! - **Direct exchanges and bindings**: routing by exact routing key
//! - **Queue arguments**: `x-dead-letter-exchange` and `x-message-ttl`
//! - **Dead-lettering**: `reject(requeue = false)` and TTL expiry re-route the
//!   message through the queue's dead-letter exchange
//! - **Prefetch**: a consumer holds at most `prefetch` unsettled deliveries
//! - **Outages**: [`InMemoryBroker::set_available`] makes connects, publishes
//!   and settlements fail and ends active consumer streams
//!
//! Unsettled deliveries that are dropped go back to the head of their queue
//! flagged as redelivered, like a closed AMQP channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::topology::{
    QueueArgument, QueueTopology, DEAD_LETTER_EXCHANGE_ARG, MESSAGE_TTL_ARG,
};
use crate::messaging::traits::{
    Acknowledger, BrokerConnector, Delivery, DeliveryStream, MessageBroker, OutboundMessage,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    routing_key: String,
    redelivered: bool,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    routing_key: String,
    queue: String,
}

#[derive(Debug, Default)]
struct QueueState {
    dead_letter_exchange: Option<String>,
    message_ttl: Option<Duration>,
    messages: VecDeque<StoredMessage>,
}

impl QueueState {
    fn from_arguments(arguments: &[(&'static str, QueueArgument)]) -> Self {
        let mut queue = Self::default();
        for (key, value) in arguments {
            match (*key, value) {
                (DEAD_LETTER_EXCHANGE_ARG, QueueArgument::Text(exchange)) => {
                    queue.dead_letter_exchange = Some(exchange.clone());
                }
                (MESSAGE_TTL_ARG, QueueArgument::Millis(ms)) => {
                    queue.message_ttl = Some(Duration::from_millis(u64::from(*ms)));
                }
                _ => {}
            }
        }
        queue
    }

    fn same_arguments(&self, other: &QueueState) -> bool {
        self.dead_letter_exchange == other.dead_letter_exchange
            && self.message_ttl == other.message_ttl
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    changed: Notify,
    next_delivery_tag: AtomicU64,
    connection_attempts: AtomicU64,
    published: AtomicU64,
}

impl Inner {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Deliver to every queue bound to `exchange` with `routing_key`. Returns
    /// the TTLs of queues that received a message so callers can schedule
    /// expiry.
    fn route(
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Vec<Duration> {
        let Some(bindings) = state.exchanges.get(exchange) else {
            return Vec::new();
        };
        let targets: Vec<String> = bindings
            .iter()
            .filter(|binding| binding.routing_key == routing_key)
            .map(|binding| binding.queue.clone())
            .collect();

        let mut ttls = Vec::new();
        for queue_name in targets {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                let mut copy = message.clone();
                copy.expires_at = queue.message_ttl.map(|ttl| Instant::now() + ttl);
                if let Some(ttl) = queue.message_ttl {
                    ttls.push(ttl);
                }
                queue.messages.push_back(copy);
            }
        }
        ttls
    }

    fn schedule_expiry(self: &Arc<Self>, ttls: Vec<Duration>) {
        for ttl in ttls {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                inner.expire_due();
            });
        }
    }

    /// Dead-letter every message whose queue TTL has elapsed
    fn expire_due(self: &Arc<Self>) {
        let now = Instant::now();
        let mut ttls = Vec::new();
        {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            for queue in state.queues.values_mut() {
                while queue
                    .messages
                    .front()
                    .and_then(|message| message.expires_at)
                    .is_some_and(|expires_at| expires_at <= now)
                {
                    if let Some(message) = queue.messages.pop_front() {
                        if let Some(exchange) = &queue.dead_letter_exchange {
                            expired.push((exchange.clone(), message));
                        }
                    }
                }
            }
            for (exchange, mut message) in expired {
                trace!(exchange = %exchange, "Message TTL elapsed, dead-lettering");
                message.redelivered = false;
                let routing_key = message.routing_key.clone();
                ttls.extend(Self::route(&mut state, &exchange, &routing_key, message));
            }
        }
        self.schedule_expiry(ttls);
        self.changed.notify_waiters();
    }

    fn take(&self, queue: &str) -> Option<StoredMessage> {
        let mut state = self.state.lock();
        state.queues.get_mut(queue)?.messages.pop_front()
    }

    fn requeue(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(queue) = self.state.lock().queues.get_mut(queue) {
            queue.messages.push_front(message);
        }
        self.changed.notify_waiters();
    }

    fn dead_letter(self: &Arc<Self>, queue: &str, mut message: StoredMessage) {
        let ttls = {
            let mut state = self.state.lock();
            let Some(exchange) = state
                .queues
                .get(queue)
                .and_then(|queue| queue.dead_letter_exchange.clone())
            else {
                debug!(queue = %queue, "Rejected message has no dead-letter exchange, dropping");
                return;
            };
            message.redelivered = false;
            message.expires_at = None;
            let routing_key = message.routing_key.clone();
            Self::route(&mut state, &exchange, &routing_key, message)
        };
        self.schedule_expiry(ttls);
        self.changed.notify_waiters();
    }
}

/// Shared in-process broker; clone the `Arc` to hand it to several components
#[derive(Debug)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                changed: Notify::new(),
                next_delivery_tag: AtomicU64::new(1),
                connection_attempts: AtomicU64::new(0),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate a broker outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    /// Ready messages in `queue` (excludes unsettled deliveries)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    pub fn connection_attempts(&self) -> u64 {
        self.inner.connection_attempts.load(Ordering::Relaxed)
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    fn ensure_available(&self) -> MessagingResult<()> {
        if self.inner.is_available() {
            Ok(())
        } else {
            Err(MessagingError::connection("in-memory broker unavailable"))
        }
    }

    fn declare_queue(
        state: &mut BrokerState,
        name: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &[(&'static str, QueueArgument)],
    ) -> MessagingResult<()> {
        let declared = QueueState::from_arguments(arguments);
        match state.queues.get(name) {
            Some(existing) if !existing.same_arguments(&declared) => {
                return Err(MessagingError::topology(
                    name,
                    "queue already declared with inequivalent arguments",
                ));
            }
            Some(_) => {}
            None => {
                state.queues.insert(name.to_string(), declared);
            }
        }

        let binding = Binding {
            routing_key: routing_key.to_string(),
            queue: name.to_string(),
        };
        let bindings = state.exchanges.entry(exchange.to_string()).or_default();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_topology(&self, topology: &QueueTopology) -> MessagingResult<()> {
        self.ensure_available()?;
        let dead_letter_exchange = topology.dead_letter_exchange();

        let mut state = self.inner.state.lock();
        state.exchanges.entry(topology.exchange.clone()).or_default();
        state.exchanges.entry(dead_letter_exchange.clone()).or_default();
        Self::declare_queue(
            &mut state,
            &topology.queue,
            &topology.exchange,
            &topology.routing_key,
            &topology.main_queue_arguments(),
        )?;
        Self::declare_queue(
            &mut state,
            &topology.retry_queue(),
            &dead_letter_exchange,
            &topology.routing_key,
            &topology.retry_queue_arguments(),
        )?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> MessagingResult<()> {
        self.ensure_available()?;

        let ttls = {
            let mut state = self.inner.state.lock();
            if !state.exchanges.contains_key(exchange) {
                return Err(MessagingError::publish(exchange, "exchange not declared"));
            }
            Inner::route(
                &mut state,
                exchange,
                routing_key,
                StoredMessage {
                    body: message.body,
                    message_id: Some(message.message_id),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    expires_at: None,
                },
            )
        };

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.schedule_expiry(ttls);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> MessagingResult<DeliveryStream> {
        self.ensure_available()?;
        if !self.has_queue(queue) {
            return Err(MessagingError::queue_not_found(queue));
        }
        debug!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "In-memory consumer started");

        let consumer = ConsumerState {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
        };

        let stream = futures::stream::unfold(consumer, |consumer| async move {
            let permit = Arc::clone(&consumer.permits).acquire_owned().await.ok()?;
            let inner = Arc::clone(&consumer.inner);
            loop {
                let changed = inner.changed.notified();
                if !inner.is_available() {
                    return None;
                }
                if let Some(message) = inner.take(&consumer.queue) {
                    let delivery_tag = inner.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
                    let delivery = Delivery::new(
                        delivery_tag,
                        message.body.clone(),
                        message.message_id.clone(),
                        message.redelivered,
                        Box::new(InMemoryAcknowledger {
                            inner: Arc::clone(&inner),
                            queue: consumer.queue.clone(),
                            delivery_tag,
                            message: Mutex::new(Some(message)),
                            permit: Mutex::new(Some(permit)),
                        }),
                    );
                    return Some((Ok(delivery), consumer));
                }
                changed.await;
            }
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        Ok(self.inner.is_available())
    }

    /// Handles share one broker, so closing a handle leaves the broker running
    async fn close(&self) -> MessagingResult<()> {
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

struct ConsumerState {
    inner: Arc<Inner>,
    queue: String,
    permits: Arc<Semaphore>,
}

struct InMemoryAcknowledger {
    inner: Arc<Inner>,
    queue: String,
    delivery_tag: u64,
    message: Mutex<Option<StoredMessage>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

enum Settlement {
    Ack,
    Reject { requeue: bool },
}

impl InMemoryAcknowledger {
    fn settle(&self, settlement: Settlement) -> MessagingResult<()> {
        let message = self.message.lock().take().ok_or_else(|| {
            MessagingError::acknowledgement(self.delivery_tag, "delivery already settled")
        })?;

        let result = if !self.inner.is_available() {
            self.inner.requeue(&self.queue, message);
            Err(MessagingError::acknowledgement(
                self.delivery_tag,
                "connection lost before settlement",
            ))
        } else {
            match settlement {
                Settlement::Ack => {}
                Settlement::Reject { requeue: true } => self.inner.requeue(&self.queue, message),
                Settlement::Reject { requeue: false } => {
                    self.inner.dead_letter(&self.queue, message)
                }
            }
            Ok(())
        };

        self.permit.lock().take();
        result
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(&self) -> MessagingResult<()> {
        self.settle(Settlement::Ack)
    }

    async fn reject(&self, requeue: bool) -> MessagingResult<()> {
        self.settle(Settlement::Reject { requeue })
    }
}

impl Drop for InMemoryAcknowledger {
    fn drop(&mut self) {
        if let Some(message) = self.message.get_mut().take() {
            self.inner.requeue(&self.queue, message);
        }
    }
}

/// Hands out the shared [`InMemoryBroker`] while it is available
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> MessagingResult<Arc<dyn MessageBroker>> {
        self.broker
            .inner
            .connection_attempts
            .fetch_add(1, Ordering::Relaxed);
        self.broker.ensure_available()?;
        Ok(Arc::clone(&self.broker) as Arc<dyn MessageBroker>)
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::CONTENT_TYPE_JSON;

    fn topology(retry_delay: Duration) -> QueueTopology {
        QueueTopology::new("alerts", "alerts.email", "email", retry_delay)
    }

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage {
            body: body.as_bytes().to_vec(),
            message_id: uuid::Uuid::new_v4().to_string(),
            content_type: CONTENT_TYPE_JSON,
            timestamp: 0,
            persistent: true,
        }
    }

    async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("delivery within timeout")
            .expect("stream open")
            .expect("delivery ok")
    }

    #[tokio::test]
    async fn test_publish_routes_to_bound_queue() {
        let broker = InMemoryBroker::new();
        let topology = topology(Duration::from_secs(60));
        broker.declare_topology(&topology).await.unwrap();

        broker
            .publish("alerts", "email", message("one"))
            .await
            .unwrap();
        broker
            .publish("alerts", "other", message("unroutable"))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("alerts.email"), 1);
        assert_eq!(broker.queue_depth("alerts.email.retry"), 0);
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn test_declare_is_idempotent_but_rejects_changed_arguments() {
        let broker = InMemoryBroker::new();
        broker.declare_topology(&topology(Duration::from_secs(1))).await.unwrap();
        broker.declare_topology(&topology(Duration::from_secs(1))).await.unwrap();

        let err = broker
            .declare_topology(&topology(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Topology { .. }));
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_exchange_fails() {
        let broker = InMemoryBroker::new();
        assert!(broker.publish("missing", "rk", message("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_message_returns_after_retry_delay() {
        let broker = InMemoryBroker::new();
        let topology = topology(Duration::from_millis(200));
        broker.declare_topology(&topology).await.unwrap();
        broker.publish("alerts", "email", message("retry-me")).await.unwrap();

        let mut stream = broker.consume("alerts.email", "test", 1).await.unwrap();
        let first = next_delivery(&mut stream).await;
        first.reject(false).await.unwrap();
        assert_eq!(broker.queue_depth("alerts.email.retry"), 1);

        let second = next_delivery(&mut stream).await;
        assert_eq!(second.data, b"retry-me");
        assert!(!second.redelivered);
        second.ack().await.unwrap();
        assert_eq!(broker.queue_depth("alerts.email"), 0);
        assert_eq!(broker.queue_depth("alerts.email.retry"), 0);
    }

    #[tokio::test]
    async fn test_requeue_marks_redelivered() {
        let broker = InMemoryBroker::new();
        broker.declare_topology(&topology(Duration::from_secs(60))).await.unwrap();
        broker.publish("alerts", "email", message("again")).await.unwrap();

        let mut stream = broker.consume("alerts.email", "test", 1).await.unwrap();
        let first = next_delivery(&mut stream).await;
        assert!(!first.redelivered);
        first.reject(true).await.unwrap();

        let second = next_delivery(&mut stream).await;
        assert!(second.redelivered);
        assert!(second.ack().await.is_ok());
        assert!(second.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_prefetch_one_holds_back_second_message() {
        let broker = InMemoryBroker::new();
        broker.declare_topology(&topology(Duration::from_secs(60))).await.unwrap();
        broker.publish("alerts", "email", message("a")).await.unwrap();
        broker.publish("alerts", "email", message("b")).await.unwrap();

        let mut stream = broker.consume("alerts.email", "test", 1).await.unwrap();
        let first = next_delivery(&mut stream).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for settlement");

        first.ack().await.unwrap();
        let second = next_delivery(&mut stream).await;
        assert_eq!(second.data, b"b");
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = InMemoryBroker::new();
        broker.declare_topology(&topology(Duration::from_secs(60))).await.unwrap();
        broker.publish("alerts", "email", message("lost")).await.unwrap();

        let mut stream = broker.consume("alerts.email", "test", 1).await.unwrap();
        drop(next_delivery(&mut stream).await);
        drop(stream);

        assert_eq!(broker.queue_depth("alerts.email"), 1);
    }

    #[tokio::test]
    async fn test_outage_ends_consumer_stream() {
        let broker = InMemoryBroker::new();
        broker.declare_topology(&topology(Duration::from_secs(60))).await.unwrap();
        let mut stream = broker.consume("alerts.email", "test", 1).await.unwrap();

        broker.set_available(false);
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(broker.publish("alerts", "email", message("x")).await.is_err());
        assert!(!broker.health_check().await.unwrap());
    }
}
