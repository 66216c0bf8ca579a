//! # Dispatch Worker
//!
//! Consumes record ids from the main queue one at a time and turns each into
//! at most one transport attempt:
//!
//! 1. Unparseable body: reject without requeue (poison message)
//! 2. Time-to-live elapsed: mark `Expired`, ack, never call the transport
//! 3. Claim failed (already claimed, terminal, missing): ack
//! 4. Transport `Sent`: mark `Sent`, ack
//! 5. Transport `Failed`: mark `Retry` or `Failed`, reject without requeue so
//!    the retry queue redelivers it after the configured delay
//!
//! A rejected poison message is dead-lettered like any other rejection, so it
//! comes back from the retry queue every retry delay and is logged each time.
//! Purge it from the main or retry queue by hand once it shows up.
//!
//! Storage errors before the claim requeue the message after a backoff so no
//! work is dropped. Losing the broker ends the consumer stream; the worker
//! reconnects with backoff and subscribes again.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::transport::{DeliveryOutcome, Transport};
use crate::channels::DispatchPayload;
use crate::error::{DispatchError, DispatchResult};
use crate::messaging::{ConnectionManager, Delivery, DispatchMessage, MessageBroker, QueueTopology};
use crate::models::{DispatchRecord, RecordId};
use crate::state_machine::{DispatchEvent, DispatchStatus, TransitionGuard};
use crate::store::RecordStore;

/// Attempts made to persist a transport outcome before giving up
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub consumer_tag: String,
    pub prefetch: u16,
    /// Pause before requeueing a message whose record could not be read
    pub storage_retry_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            consumer_tag: "dispatch-worker".to_string(),
            prefetch: 1,
            storage_retry_backoff: Duration::from_secs(1),
        }
    }
}

/// How a delivery was settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject without requeue: dead-lettered into the retry loop or dropped
    Reject,
    /// Reject with requeue: redelivered from the main queue
    Requeue,
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub deliveries: AtomicU64,
    pub sent: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    pub expired: AtomicU64,
    /// Deliveries whose record was not claimable (duplicate or late redelivery)
    pub skipped: AtomicU64,
    pub poison: AtomicU64,
    pub requeued: AtomicU64,
    pub settle_errors: AtomicU64,
    pub reconnects: AtomicU64,
}

pub struct DispatchWorker<P, S, T> {
    store: Arc<S>,
    transport: T,
    connections: Arc<ConnectionManager>,
    topology: QueueTopology,
    settings: WorkerSettings,
    stats: Arc<WorkerStats>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, S, T> std::fmt::Debug for DispatchWorker<P, S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchWorker")
            .field("queue", &self.topology.queue)
            .field("settings", &self.settings)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<P, S, T> DispatchWorker<P, S, T>
where
    P: DispatchPayload,
    S: RecordStore<P>,
    T: Transport<P>,
{
    pub fn new(
        store: Arc<S>,
        transport: T,
        connections: Arc<ConnectionManager>,
        topology: QueueTopology,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            transport,
            connections,
            topology,
            settings,
            stats: Arc::new(WorkerStats::default()),
            _payload: PhantomData,
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Consume until `shutdown` fires. The delivery in progress when the
    /// signal arrives is finished and settled before returning.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> DispatchResult<()> {
        info!(
            channel = P::CHANNEL,
            queue = %self.topology.queue,
            transport = self.transport.name(),
            consumer_tag = %self.settings.consumer_tag,
            "Dispatch worker starting"
        );

        let mut consume_failures = 0u32;
        'connection: loop {
            let broker = tokio::select! {
                _ = shutdown.recv() => break 'connection,
                broker = self.acquire_broker() => broker,
            };

            let mut deliveries = match broker
                .consume(
                    &self.topology.queue,
                    &self.settings.consumer_tag,
                    self.settings.prefetch,
                )
                .await
            {
                Ok(stream) => {
                    consume_failures = 0;
                    stream
                }
                Err(e) => {
                    consume_failures = consume_failures.saturating_add(1);
                    let delay = self.connections.policy().delay_for_attempt(consume_failures);
                    warn!(
                        queue = %self.topology.queue,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to start consumer, retrying"
                    );
                    if e.is_connection_error() {
                        self.connections.invalidate().await;
                    }
                    tokio::select! {
                        _ = shutdown.recv() => break 'connection,
                        _ = tokio::time::sleep(delay) => continue 'connection,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break 'connection,
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            self.handle_delivery(delivery).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Consumer stream error, reconnecting");
                            break;
                        }
                        None => {
                            warn!(queue = %self.topology.queue, "Consumer stream ended, reconnecting");
                            break;
                        }
                    },
                }
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            self.connections.invalidate().await;
        }

        if let Err(e) = self.connections.close().await {
            warn!(error = %e, "Closing broker connection failed");
        }
        info!(channel = P::CHANNEL, "Dispatch worker stopped");
        Ok(())
    }

    async fn acquire_broker(&self) -> Arc<dyn MessageBroker> {
        match self.connections.broker().await {
            Ok(broker) => broker,
            Err(e) => {
                warn!(error = %e, "Broker unavailable, reconnecting with backoff");
                self.connections.reconnect_with_backoff().await
            }
        }
    }

    /// Process one delivery and settle it with the broker
    pub async fn handle_delivery(&self, delivery: Delivery) -> Disposition {
        self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
        let disposition = self.process(&delivery).await;

        let settled = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Reject => delivery.reject(false).await,
            Disposition::Requeue => delivery.reject(true).await,
        };
        if let Err(e) = settled {
            self.stats.settle_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                delivery_tag = delivery.delivery_tag,
                disposition = ?disposition,
                error = %e,
                "Failed to settle delivery, broker will redeliver"
            );
        }
        disposition
    }

    async fn process(&self, delivery: &Delivery) -> Disposition {
        let message = match DispatchMessage::from_bytes(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                self.stats.poison.fetch_add(1, Ordering::Relaxed);
                error!(
                    delivery_tag = delivery.delivery_tag,
                    message_id = ?delivery.message_id,
                    error = %e,
                    "Unparseable message, rejecting without requeue; it will recirculate through the retry queue until purged"
                );
                return Disposition::Reject;
            }
        };
        let id = message.id;

        match self.store.expire_if_due(id, Utc::now()).await {
            Ok(true) => {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                info!(record_id = %id, channel = P::CHANNEL, "Record expired before delivery");
                return Disposition::Ack;
            }
            Ok(false) => {}
            Err(e) => return self.requeue_after_backoff(id, "expire_if_due", e).await,
        }

        let record = match self.store.claim_for_processing(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    record_id = %id,
                    redelivered = delivery.redelivered,
                    "Record not claimable, acknowledging"
                );
                return Disposition::Ack;
            }
            Err(e) => return self.requeue_after_backoff(id, "claim_for_processing", e).await,
        };

        self.attempt(record).await
    }

    #[instrument(skip(self, record), fields(record_id = %record.id, channel = P::CHANNEL, attempt = record.retry_count + 1))]
    async fn attempt(&self, record: DispatchRecord<P>) -> Disposition {
        match self.transport.send(&record).await {
            DeliveryOutcome::Sent => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                self.write_outcome(record.id, DispatchStatus::Sent, None).await;
                info!("Record sent");
                Disposition::Ack
            }
            DeliveryOutcome::Failed(reason) => {
                let next = match TransitionGuard::transition(
                    DispatchStatus::Sending,
                    DispatchEvent::TransportFailed {
                        retry_count: record.retry_count,
                        max_retry_count: record.max_retry_count,
                    },
                ) {
                    Ok(status) => status,
                    Err(e) => {
                        error!(error = %e, "Unresolvable failure transition, failing record");
                        DispatchStatus::Failed
                    }
                };

                if next == DispatchStatus::Retry {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        retry_count = record.retry_count + 1,
                        max_retry_count = record.max_retry_count,
                        reason = %reason,
                        "Transport failed, scheduling retry"
                    );
                } else {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        retry_count = record.retry_count,
                        max_retry_count = record.max_retry_count,
                        reason = %reason,
                        "Transport failed, retry budget exhausted"
                    );
                }

                self.write_outcome(record.id, next, Some(reason)).await;
                Disposition::Reject
            }
        }
    }

    /// Persist the post-attempt status, retrying storage errors in place. The
    /// transport has already run, so the message is settled regardless.
    async fn write_outcome(&self, id: RecordId, status: DispatchStatus, error: Option<String>) {
        for attempt in 1..=OUTCOME_WRITE_ATTEMPTS {
            match self.store.set_status(id, status, error.clone()).await {
                Ok(_) => return,
                Err(e) if attempt < OUTCOME_WRITE_ATTEMPTS && e.is_retryable() => {
                    warn!(
                        record_id = %id,
                        status = %status,
                        attempt,
                        error = %e,
                        "Status write failed, retrying"
                    );
                    tokio::time::sleep(self.settings.storage_retry_backoff).await;
                }
                Err(e) => {
                    error!(
                        record_id = %id,
                        status = %status,
                        error = %e,
                        "Status write failed, record left in sending"
                    );
                    return;
                }
            }
        }
    }

    async fn requeue_after_backoff(
        &self,
        id: RecordId,
        operation: &'static str,
        error: DispatchError,
    ) -> Disposition {
        self.stats.requeued.fetch_add(1, Ordering::Relaxed);
        warn!(
            record_id = %id,
            operation,
            error = %error,
            backoff_ms = self.settings.storage_retry_backoff.as_millis() as u64,
            "Record store unavailable, requeueing message"
        );
        tokio::time::sleep(self.settings.storage_retry_backoff).await;
        Disposition::Requeue
    }
}
