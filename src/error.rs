//! Error types for the dispatch core.
//!

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::models::RecordId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed record rejected before persistence
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dispatch record not found: {0}")]
    NotFound(RecordId),

    /// Record store unavailable or query failure
    #[error("Storage error: {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("Broker error: {0}")]
    Broker(#[from] MessagingError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Storage and broker failures are infrastructure problems worth retrying
    /// at the boundary where they occurred.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Broker(_))
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        DispatchError::storage("query", err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Internal(format!("JSON serialization error: {err}"))
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
