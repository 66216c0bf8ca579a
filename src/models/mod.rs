//! # Models
//!
//! Persisted data shapes shared by the store, publisher, worker and sweeper.

pub mod record;

pub use record::{
    DispatchRecord, NewDispatchRecord, RecordFilter, RecordId, DEFAULT_MAX_RETRY_COUNT,
};
