use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a dispatch record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Created, not yet confirmed on the broker
    #[default]
    Pending,
    /// Message confirmed on the main queue
    Queued,
    /// Claimed by exactly one worker; transport attempt in progress
    Sending,
    /// Transport accepted the record
    Sent,
    /// Last attempt failed; waiting in the retry queue for redelivery
    Retry,
    /// Retry budget exhausted
    Failed,
    /// Time-to-live elapsed before the record could be sent
    Expired,
}

impl DispatchStatus {
    pub const ALL: [DispatchStatus; 7] = [
        Self::Pending,
        Self::Queued,
        Self::Sending,
        Self::Sent,
        Self::Retry,
        Self::Failed,
        Self::Expired,
    ];

    /// States a worker may claim from. `Retry` is how a dead-letter
    /// redelivered record looks in the store; `Pending` covers a delivery that
    /// races ahead of the publisher's `Queued` write.
    pub const CLAIMABLE: [DispatchStatus; 3] = [Self::Pending, Self::Queued, Self::Retry];

    /// States that may still expire when their time-to-live elapses
    pub const EXPIRABLE: [DispatchStatus; 3] = [Self::Pending, Self::Queued, Self::Retry];

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Expired)
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }

    pub fn is_expirable(&self) -> bool {
        Self::EXPIRABLE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Retry => "retry",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Human readable status message shown to callers polling a record
    pub fn description(&self) -> &'static str {
        match self {
            Self::Pending => "The notification is pending sending.",
            Self::Queued => "The notification is queued for processing.",
            Self::Sending => "The notification is being processed by the consumer.",
            Self::Sent => "The notification was successfully sent.",
            Self::Retry => "The notification is waiting in the retry queue.",
            Self::Failed => "The notification failed to send.",
            Self::Expired => "The notification delivery has expired.",
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DispatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "retry" => Ok(Self::Retry),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid dispatch status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = DispatchStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                &DispatchStatus::Sent,
                &DispatchStatus::Failed,
                &DispatchStatus::Expired
            ]
        );
    }

    #[test]
    fn test_string_forms_parse_back() {
        for status in DispatchStatus::ALL {
            assert_eq!(status.as_str().parse::<DispatchStatus>(), Ok(status));
        }
        assert!("entrusted".parse::<DispatchStatus>().is_err());
    }

    #[test]
    fn test_sending_is_not_claimable() {
        assert!(!DispatchStatus::Sending.is_claimable());
        assert!(DispatchStatus::Retry.is_claimable());
        assert_eq!(DispatchStatus::default(), DispatchStatus::Pending);
    }
}
