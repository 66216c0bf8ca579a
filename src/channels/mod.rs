//! # Channels
//!
//! Payload types for each dispatch pipeline. The dispatch core is generic over
//! [`DispatchPayload`]; a channel only contributes its content shape, its
//! validation rules and whether it is time-sensitive.

pub mod email;
pub mod relay;
pub mod sms;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::DispatchResult;

pub use email::EmailPayload;
pub use relay::RelayPayload;
pub use sms::SmsPayload;

/// Content carried by a dispatch record
pub trait DispatchPayload:
    Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    /// Channel name stored with every record (`email`, `sms`, ...)
    const CHANNEL: &'static str;

    /// Reject malformed content before it is persisted
    fn validate(&self) -> DispatchResult<()>;

    /// Time-sensitive channels return how long a record may wait before it
    /// expires instead of being sent.
    fn time_to_live(&self) -> Option<Duration> {
        None
    }
}

/// Minimal address syntax check: one `@`, non-empty local part, dotted domain,
/// no whitespace.
pub(crate) fn is_valid_email(address: &str) -> bool {
    if address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_syntax() {
        assert!(is_valid_email("ops@example.com"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("ops@example"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ops@@example.com"));
        assert!(!is_valid_email("ops @example.com"));
        assert!(!is_valid_email("ops@example.com."));
        assert!(!is_valid_email(""));
    }
}
