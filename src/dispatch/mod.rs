//! # Dispatch Core
//!
//! The channel-agnostic pipeline, instantiated once per payload type:
//!
//! ```text
//! DispatchService::create -> RecordStore (Pending)
//!                         -> Publisher -> broker main queue (Queued)
//! DispatchWorker <- main queue: claim (Sending) -> Transport -> Sent | Retry | Failed
//! ReconciliationSweeper: expire overdue, republish stale Pending
//! ```

pub mod publisher;
pub mod service;
pub mod sweeper;
pub mod transport;
pub mod worker;

pub use publisher::{Publisher, PublisherStats};
pub use service::DispatchService;
pub use sweeper::{ReconciliationSweeper, SweepReport, SweeperSettings, SweeperStats};
pub use transport::{DeliveryOutcome, Transport};
pub use worker::{Disposition, DispatchWorker, WorkerSettings, WorkerStats};
