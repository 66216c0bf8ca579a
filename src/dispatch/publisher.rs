//! # Publisher
//!
//! Puts a record id on the main exchange and, once the broker has confirmed
//! it, records the `Pending -> Queued` transition. A failed publish leaves the
//! record `Pending` for the reconciliation sweeper.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::channels::DispatchPayload;
use crate::error::DispatchResult;
use crate::messaging::{
    ConnectionManager, DispatchMessage, OutboundMessage, QueueTopology, CONTENT_TYPE_JSON,
};
use crate::models::RecordId;
use crate::store::RecordStore;

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    /// Confirmed publishes whose record had already left `Pending`
    pub already_advanced: AtomicU64,
}

pub struct Publisher<P, S> {
    store: Arc<S>,
    connections: Arc<ConnectionManager>,
    topology: QueueTopology,
    stats: PublisherStats,
    _payload: PhantomData<fn() -> P>,
}

impl<P, S> std::fmt::Debug for Publisher<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange", &self.topology.exchange)
            .field("routing_key", &self.topology.routing_key)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<P: DispatchPayload, S: RecordStore<P>> Publisher<P, S> {
    pub fn new(store: Arc<S>, connections: Arc<ConnectionManager>, topology: QueueTopology) -> Self {
        Self {
            store,
            connections,
            topology,
            stats: PublisherStats::default(),
            _payload: PhantomData,
        }
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    /// Publish `id` and mark it `Queued`. Returns whether the broker accepted
    /// the message; failures are logged and leave the record `Pending`.
    #[instrument(skip(self), fields(channel = P::CHANNEL))]
    pub async fn publish(&self, id: RecordId) -> bool {
        match self.publish_and_confirm(id).await {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    record_id = %id,
                    error = %e,
                    "Publish failed, record stays pending for reconciliation"
                );
                return false;
            }
        }

        match self.store.mark_queued(id).await {
            Ok(true) => debug!(record_id = %id, "Record queued"),
            Ok(false) => {
                self.stats.already_advanced.fetch_add(1, Ordering::Relaxed);
                debug!(record_id = %id, "Record already past pending, leaving status as is");
            }
            Err(e) => error!(
                record_id = %id,
                error = %e,
                "Message published but queued status was not recorded"
            ),
        }
        true
    }

    async fn publish_and_confirm(&self, id: RecordId) -> DispatchResult<()> {
        let broker = self.connections.broker().await?;
        let message = OutboundMessage {
            body: DispatchMessage::new(id).to_bytes()?,
            message_id: Uuid::new_v4().to_string(),
            content_type: CONTENT_TYPE_JSON,
            timestamp: u64::try_from(Utc::now().timestamp()).unwrap_or_default(),
            persistent: true,
        };

        if let Err(e) = broker
            .publish(&self.topology.exchange, &self.topology.routing_key, message)
            .await
        {
            if e.is_connection_error() {
                self.connections.invalidate().await;
            }
            return Err(e.into());
        }
        Ok(())
    }
}
