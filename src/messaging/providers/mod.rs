//! # Broker Providers
//!
//! - [`RabbitMqBroker`] - RabbitMQ via the `lapin` crate
//! - [`InMemoryBroker`] - in-process broker with dead-letter and TTL semantics, for tests

pub mod in_memory;
pub mod rabbitmq;

pub use in_memory::{InMemoryBroker, InMemoryConnector};
pub use rabbitmq::{RabbitMqBroker, RabbitMqConnector, RabbitMqSettings};
