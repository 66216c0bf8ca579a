#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, RabbitMQ in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dispatch Core
//!
//! Durable, at-least-once notification dispatch for email, SMS and event-relay
//! pipelines, built on PostgreSQL for record state and RabbitMQ for delivery.
//!
//! ## Overview
//!
//! Every outgoing message is a [`models::DispatchRecord`] persisted before it is
//! published. The broker only carries record ids; the record store is the
//! source of truth for status, retry budget and expiry. Each channel runs the
//! same generic pipeline over its own payload type:
//!
//! - [`dispatch::DispatchService`] creates records and publishes them
//! - [`dispatch::DispatchWorker`] claims each record atomically and calls the
//!   channel's [`dispatch::Transport`] at most once per delivery
//! - failures dead-letter into a delay queue and come back after the retry
//!   delay until the record's retry budget is spent
//! - [`dispatch::ReconciliationSweeper`] expires overdue records and republishes
//!   records that never reached the broker
//!
//! ## Module Organization
//!
//! - [`models`] - Dispatch records, filters and identifiers
//! - [`channels`] - Payload types and their validation
//! - [`state_machine`] - Record statuses and legal transitions
//! - [`store`] - Record persistence (PostgreSQL and in-memory)
//! - [`messaging`] - Broker abstraction, topology and RabbitMQ provider
//! - [`dispatch`] - Publisher, worker, sweeper and service
//! - [`bootstrap`] - Wiring and lifecycle for a running pipeline
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - `tracing` subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use dispatch_core::channels::EmailPayload;
//! use dispatch_core::dispatch::{DeliveryOutcome, Transport};
//! use dispatch_core::models::{DispatchRecord, NewDispatchRecord};
//!
//! struct SmtpTransport;
//!
//! #[async_trait]
//! impl Transport<EmailPayload> for SmtpTransport {
//!     async fn send(&self, record: &DispatchRecord<EmailPayload>) -> DeliveryOutcome {
//!         // hand record.payload to the mail provider
//!         DeliveryOutcome::Sent
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "smtp"
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! dispatch_core::logging::init_structured_logging();
//! let config = dispatch_core::config::load_config()?;
//! let mut system = dispatch_core::bootstrap::bootstrap(&config, SmtpTransport).await?;
//!
//! let payload = EmailPayload::new("ops@example.com", "Disk almost full", "<p>92%</p>");
//! let record = system.service().create(NewDispatchRecord::new(payload)).await?;
//! println!("{} is {}", record.id, record.status);
//!
//! system.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod state_machine;
pub mod store;

pub use bootstrap::{DispatchSettings, DispatchSystemHandle};
pub use channels::DispatchPayload;
pub use config::DispatchConfig;
pub use error::{DispatchError, DispatchResult};
pub use models::{DispatchRecord, NewDispatchRecord, RecordFilter, RecordId};
pub use state_machine::DispatchStatus;
