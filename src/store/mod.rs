//! # Record Store
//!
//! Durable storage for dispatch records and the compare-and-set operations
//! that make claiming safe across workers.

pub mod in_memory;
pub mod postgres;
pub mod traits;

pub use in_memory::InMemoryRecordStore;
pub use postgres::{run_migrations, PgRecordStore};
pub use traits::{RecordStore, EXPIRED_MESSAGE};
