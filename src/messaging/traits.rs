//! # Broker Traits
//!
//! Provider-agnostic broker operations used by the publisher and worker.
//! Providers (RabbitMQ, in-memory) implement [`MessageBroker`]; a
//! [`BrokerConnector`] knows how to open a fresh broker handle so the
//! [`ConnectionManager`](super::ConnectionManager) can replace a dead one.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::MessagingResult;
use super::topology::QueueTopology;

/// Manual acknowledgement handle for one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> MessagingResult<()>;

    /// Reject the delivery. With `requeue = false` the broker dead-letters it.
    async fn reject(&self, requeue: bool) -> MessagingResult<()>;
}

/// A message handed to a consumer. Until it is acked or rejected the broker
/// will not hand the consumer another one (prefetch = 1).
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub message_id: Option<String>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        data: Vec<u8>,
        message_id: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            data,
            message_id,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> MessagingResult<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> MessagingResult<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, MessagingResult<Delivery>>;

/// Properties attached to every published message
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub message_id: String,
    pub content_type: &'static str,
    /// Unix seconds
    pub timestamp: u64,
    pub persistent: bool,
}

#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Declare exchanges, queues and bindings for `topology` (idempotent)
    async fn declare_topology(&self, topology: &QueueTopology) -> MessagingResult<()>;

    /// Publish and wait for the broker to confirm it
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> MessagingResult<()>;

    /// Start a manual-ack consumer. The stream ends when the connection is lost.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> MessagingResult<DeliveryStream>;

    async fn health_check(&self) -> MessagingResult<bool>;

    async fn close(&self) -> MessagingResult<()>;

    fn provider_name(&self) -> &'static str;
}

/// Opens broker handles for the connection manager
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self) -> MessagingResult<Arc<dyn MessageBroker>>;

    /// Connection target with credentials removed, for logs
    fn describe(&self) -> String;
}
