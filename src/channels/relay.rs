use serde::{Deserialize, Serialize};

use super::DispatchPayload;
use crate::error::{DispatchError, DispatchResult};

/// Cross-service event relay: forwards an event body to another service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPayload {
    pub event_type: String,
    /// Destination identifier understood by the relay transport
    pub target: String,
    pub body: serde_json::Value,
}

impl RelayPayload {
    pub fn new(
        event_type: impl Into<String>,
        target: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            target: target.into(),
            body,
        }
    }
}

impl DispatchPayload for RelayPayload {
    const CHANNEL: &'static str = "relay";

    fn validate(&self) -> DispatchResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(DispatchError::validation("event_type is required"));
        }
        if self.target.trim().is_empty() {
            return Err(DispatchError::validation("target is required"));
        }
        if self.body.is_null() {
            return Err(DispatchError::validation("body must not be null"));
        }
        Ok(())
    }
}
