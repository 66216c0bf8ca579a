//! # Messaging
//!
//! Broker plumbing for the dispatch pipeline: the id-only queue message, the
//! dead-letter retry topology, the provider-agnostic [`MessageBroker`] trait and
//! the [`ConnectionManager`] that owns and recovers broker connections.

pub mod connection;
pub mod errors;
pub mod message;
pub mod providers;
pub mod topology;
pub mod traits;

pub use connection::{ConnectionManager, ReconnectPolicy};
pub use errors::{MessagingError, MessagingResult};
pub use message::{DispatchMessage, CONTENT_TYPE_JSON};
pub use topology::QueueTopology;
pub use traits::{
    Acknowledger, BrokerConnector, Delivery, DeliveryStream, MessageBroker, OutboundMessage,
};
