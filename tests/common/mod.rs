//! Shared fixtures for dispatch integration tests: a scripted transport, a
//! recording acknowledger and an in-memory pipeline harness.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_core::bootstrap::{self, DispatchSettings, DispatchSystemHandle};
use dispatch_core::dispatch::{DeliveryOutcome, SweeperSettings, Transport, WorkerSettings};
use dispatch_core::messaging::providers::in_memory::{InMemoryBroker, InMemoryConnector};
use dispatch_core::messaging::{
    Acknowledger, BrokerConnector, ConnectionManager, Delivery, DispatchMessage, MessageBroker,
    MessagingResult, OutboundMessage, QueueTopology, ReconnectPolicy, CONTENT_TYPE_JSON,
};
use dispatch_core::models::{DispatchRecord, RecordId};
use dispatch_core::store::{InMemoryRecordStore, RecordStore};
use dispatch_core::{DispatchPayload, DispatchStatus};
use parking_lot::Mutex;

pub const RETRY_DELAY: Duration = Duration::from_millis(50);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport that replays a script of outcomes, then repeats a fallback
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    fallback: DeliveryOutcome,
    calls: AtomicUsize,
    attempted: Mutex<Vec<RecordId>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<DeliveryOutcome>, fallback: DeliveryOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            attempted: Mutex::new(Vec::new()),
        }
    }

    pub fn always_sent() -> Self {
        Self::new(Vec::new(), DeliveryOutcome::Sent)
    }

    pub fn always_failing(reason: &str) -> Self {
        Self::new(Vec::new(), DeliveryOutcome::failed(reason))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, id: RecordId) -> usize {
        self.attempted.lock().iter().filter(|&&seen| seen == id).count()
    }
}

#[async_trait]
impl<P: DispatchPayload> Transport<P> for ScriptedTransport {
    async fn send(&self, record: &DispatchRecord<P>) -> DeliveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempted.lock().push(record.id);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// How a hand-built delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected { requeue: bool },
}

/// Acknowledger that records the settlement instead of talking to a broker
#[derive(Debug, Clone, Default)]
pub struct RecordingAcknowledger {
    settlements: Arc<Mutex<Vec<Settlement>>>,
}

impl RecordingAcknowledger {
    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().clone()
    }

    pub fn delivery(&self, data: Vec<u8>) -> Delivery {
        Delivery::new(1, data, None, false, Box::new(self.clone()))
    }
}

#[async_trait]
impl Acknowledger for RecordingAcknowledger {
    async fn ack(&self) -> MessagingResult<()> {
        self.settlements.lock().push(Settlement::Acked);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> MessagingResult<()> {
        self.settlements.lock().push(Settlement::Rejected { requeue });
        Ok(())
    }
}

pub fn test_topology() -> QueueTopology {
    QueueTopology::new("test.dispatch", "test.dispatch.main", "main", RETRY_DELAY)
}

pub fn fast_reconnect_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        max_startup_attempts: 3,
    }
}

/// Sweeper disabled so tests drive it with `sweep_once`; every pending record
/// counts as stale.
pub fn test_settings() -> DispatchSettings {
    DispatchSettings {
        topology: test_topology(),
        reconnect: fast_reconnect_policy(),
        worker: WorkerSettings {
            consumer_tag: "test-worker".to_string(),
            prefetch: 1,
            storage_retry_backoff: Duration::from_millis(20),
        },
        sweeper: SweeperSettings {
            enabled: false,
            interval: Duration::from_secs(60),
            pending_threshold: Duration::ZERO,
            batch_size: 100,
        },
        default_max_retry_count: 3,
    }
}

pub fn connection_manager(broker: &Arc<InMemoryBroker>) -> Arc<ConnectionManager> {
    let connector: Arc<dyn BrokerConnector> = Arc::new(InMemoryConnector::new(Arc::clone(broker)));
    Arc::new(ConnectionManager::new(connector, fast_reconnect_policy()).with_topology(test_topology()))
}

/// A running pipeline over the in-memory store and broker
pub struct Harness<P: DispatchPayload> {
    pub store: Arc<InMemoryRecordStore<P>>,
    pub broker: Arc<InMemoryBroker>,
    pub transport: Arc<ScriptedTransport>,
    pub system: DispatchSystemHandle<P, InMemoryRecordStore<P>>,
}

impl<P: DispatchPayload> Harness<P> {
    pub async fn start(transport: ScriptedTransport) -> Self {
        Self::start_with(transport, test_settings()).await
    }

    pub async fn start_with(transport: ScriptedTransport, settings: DispatchSettings) -> Self {
        let store = Arc::new(InMemoryRecordStore::<P>::new());
        let broker = Arc::new(InMemoryBroker::new());
        let transport = Arc::new(transport);
        let connector: Arc<dyn BrokerConnector> =
            Arc::new(InMemoryConnector::new(Arc::clone(&broker)));

        let system = bootstrap::start(
            Arc::clone(&store),
            connector,
            Arc::clone(&transport),
            settings,
        )
        .await
        .expect("pipeline should start against the in-memory broker");

        Self {
            store,
            broker,
            transport,
            system,
        }
    }

    /// Publish a raw body to the main exchange, bypassing the publisher
    pub async fn publish_raw(&self, body: Vec<u8>) {
        let topology = test_topology();
        let message = OutboundMessage {
            body,
            message_id: uuid::Uuid::new_v4().to_string(),
            content_type: CONTENT_TYPE_JSON,
            timestamp: 0,
            persistent: true,
        };
        self.broker
            .publish(&topology.exchange, &topology.routing_key, message)
            .await
            .expect("in-memory publish");
    }

    pub async fn publish_id(&self, id: RecordId) {
        let body = DispatchMessage::new(id).to_bytes().expect("serialize message");
        self.publish_raw(body).await;
    }

    pub async fn wait_for_status(&self, id: RecordId, status: DispatchStatus) -> DispatchRecord<P> {
        wait_for_status(self.store.as_ref(), id, status).await
    }

    /// Wait until the main and retry queues are empty and nothing is in flight
    pub async fn wait_until_idle(&self) {
        let topology = test_topology();
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let queued = self.broker.queue_depth(&topology.queue)
                + self.broker.queue_depth(&topology.retry_queue());
            if queued == 0 {
                // Let an in-flight delivery settle
                tokio::time::sleep(Duration::from_millis(50)).await;
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "queues did not drain: {queued} message(s) left"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(mut self) {
        self.system.shutdown().await.expect("clean shutdown");
    }
}

/// Poll the store until `id` reaches `status`
pub async fn wait_for_status<P, S>(store: &S, id: RecordId, status: DispatchStatus) -> DispatchRecord<P>
where
    P: DispatchPayload,
    S: RecordStore<P>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let record = store.get(id).await.expect("record exists");
        if record.status == status {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "record {id} stuck in {} waiting for {status}",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
