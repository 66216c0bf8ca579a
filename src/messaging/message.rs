//! Queue message body. Messages carry only the record id; the record store
//! stays the source of truth for content and status.

use serde::{Deserialize, Serialize};

use super::errors::{MessagingError, MessagingResult};
use crate::models::RecordId;

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub id: RecordId,
}

impl DispatchMessage {
    pub fn new(id: RecordId) -> Self {
        Self { id }
    }

    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}
