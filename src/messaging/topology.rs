//! # Queue Topology
//!
//! Naming and arguments for the dead-letter retry loop:
//!
//! ```text
//! main exchange --rk--> main queue --(reject, no requeue)--> {exchange}.dlx
//!      ^                                                          |
//!      |                                                          rk
//!      +---- (x-message-ttl expires) ---- {queue}.retry <---------+
//! ```
//!
//! Rejected messages park on the retry queue for `retry_delay` and are then
//! dead-lettered back onto the main exchange.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub retry_delay: Duration,
}

/// Queue arguments independent of the broker client's field table type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueArgument {
    Text(String),
    Millis(u32),
}

impl QueueTopology {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            retry_delay,
        }
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange)
    }

    pub fn retry_queue(&self) -> String {
        format!("{}.retry", self.queue)
    }

    /// Broker TTL is a 32-bit millisecond count; longer delays saturate.
    pub fn retry_delay_ms(&self) -> u32 {
        u32::try_from(self.retry_delay.as_millis()).unwrap_or(u32::MAX)
    }

    pub fn main_queue_arguments(&self) -> Vec<(&'static str, QueueArgument)> {
        vec![(
            DEAD_LETTER_EXCHANGE_ARG,
            QueueArgument::Text(self.dead_letter_exchange()),
        )]
    }

    pub fn retry_queue_arguments(&self) -> Vec<(&'static str, QueueArgument)> {
        vec![
            (MESSAGE_TTL_ARG, QueueArgument::Millis(self.retry_delay_ms())),
            (
                DEAD_LETTER_EXCHANGE_ARG,
                QueueArgument::Text(self.exchange.clone()),
            ),
        ]
    }
}
