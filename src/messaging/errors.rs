//! # Messaging Error Types
//!
//! Structured broker errors. Every provider maps its client errors into these
//! variants so the dispatch layer never sees `lapin` types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Topology declaration failed: {name}: {message}")]
    Topology { name: String, message: String },

    #[error("Publish failed: {exchange}: {message}")]
    Publish { exchange: String, message: String },

    #[error("Publish not confirmed by broker: {exchange}")]
    PublishNotConfirmed { exchange: String },

    #[error("Consume failed: {queue_name}: {message}")]
    Consume { queue_name: String, message: String },

    #[error("Acknowledgement failed: delivery {delivery_tag}: {message}")]
    Acknowledgement { delivery_tag: u64, message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Broker connection closed")]
    Closed,

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn topology(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn publish(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            message: message.into(),
        }
    }

    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn acknowledgement(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            delivery_tag,
            message: message.into(),
        }
    }

    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a fresh connection is likely to fix the failure
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Closed)
    }
}

impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
                Self::connection(err.to_string())
            }
            lapin::Error::IOError(_) => Self::connection(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::message_deserialization(err.to_string())
        } else {
            Self::message_serialization(err.to_string())
        }
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MessagingError::publish("alerts", "channel closed");
        assert_eq!(err.to_string(), "Publish failed: alerts: channel closed");

        let err = MessagingError::acknowledgement(7, "gone");
        assert!(err.to_string().contains("delivery 7"));
    }

    #[test]
    fn test_connection_classification() {
        assert!(MessagingError::connection("refused").is_connection_error());
        assert!(MessagingError::Closed.is_connection_error());
        assert!(!MessagingError::queue_not_found("q").is_connection_error());
    }

    #[test]
    fn test_json_error_is_deserialization() {
        let err: MessagingError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, MessagingError::MessageDeserialization { .. }));
    }
}
