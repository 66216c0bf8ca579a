//! # State Machine Events
//!
//! Events that drive a dispatch record through its lifecycle.
//!
//! | Event | Raised by | Description |
//! |-------|-----------|-------------|
//! | `Published` | Publisher | Broker confirmed the message |
//! | `ReconciliationRepublished` | Sweeper | Stale pending record republished |
//! | `Claimed` | Worker | Atomic claim won |
//! | `TransportSucceeded` | Worker | Transport accepted the record |
//! | `TransportFailed` | Worker | Transport rejected the record |
//! | `Redelivered` | Broker | Retry-queue TTL elapsed, message back on main queue |
//! | `TtlElapsed` | Worker / Sweeper | Time-sensitive record outlived its TTL |

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DispatchEvent {
    Published,
    ReconciliationRepublished,
    Claimed,
    TransportSucceeded,
    /// Carries the retry counters read from the claimed record
    TransportFailed {
        retry_count: i32,
        max_retry_count: i32,
    },
    Redelivered,
    TtlElapsed,
}

impl DispatchEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::ReconciliationRepublished => "reconciliation_republished",
            Self::Claimed => "claimed",
            Self::TransportSucceeded => "transport_succeeded",
            Self::TransportFailed { .. } => "transport_failed",
            Self::Redelivered => "redelivered",
            Self::TtlElapsed => "ttl_elapsed",
        }
    }
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}
