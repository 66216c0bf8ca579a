use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::DispatchPayload;
use crate::error::{DispatchError, DispatchResult};

/// Default SMS time-to-live in minutes
pub const DEFAULT_SMS_TTL_MINUTES: u32 = 5;

const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

/// Outbound SMS content. SMS is time-sensitive: an alert that could not be
/// delivered within its TTL is expired rather than sent late.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsPayload {
    /// E.164 formatted number, e.g. `+40721000000`
    pub phone_number: String,
    pub message: String,
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u32,
    pub country_code: Option<String>,
    pub message_type: Option<String>,
    pub custom_data: Option<serde_json::Value>,
}

fn default_ttl_minutes() -> u32 {
    DEFAULT_SMS_TTL_MINUTES
}

impl SmsPayload {
    pub fn new(phone_number: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            message: message.into(),
            ttl_minutes: DEFAULT_SMS_TTL_MINUTES,
            country_code: None,
            message_type: None,
            custom_data: None,
        }
    }

    pub fn with_ttl_minutes(mut self, ttl_minutes: u32) -> Self {
        self.ttl_minutes = ttl_minutes;
        self
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }
}

fn is_valid_phone_number(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
}

impl DispatchPayload for SmsPayload {
    const CHANNEL: &'static str = "sms";

    fn validate(&self) -> DispatchResult<()> {
        if self.phone_number.trim().is_empty() {
            return Err(DispatchError::validation("phone_number is required"));
        }
        if !is_valid_phone_number(&self.phone_number) {
            return Err(DispatchError::validation(format!(
                "phone_number is not a valid E.164 number: {}",
                self.phone_number
            )));
        }
        if self.message.trim().is_empty() {
            return Err(DispatchError::validation("message is required"));
        }
        if self.ttl_minutes == 0 {
            return Err(DispatchError::validation("ttl_minutes must be positive"));
        }
        Ok(())
    }

    fn time_to_live(&self) -> Option<Duration> {
        Some(Duration::from_secs(u64::from(self.ttl_minutes) * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ttl() {
        let payload = SmsPayload::new("+40721000000", "Temperature high");
        assert!(payload.validate().is_ok());
        assert_eq!(payload.time_to_live(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_ttl_defaults_when_missing_from_json() {
        let payload: SmsPayload = serde_json::from_value(serde_json::json!({
            "phone_number": "+40721000000",
            "message": "hello",
            "country_code": null,
            "message_type": null,
            "custom_data": null
        }))
        .unwrap();
        assert_eq!(payload.ttl_minutes, DEFAULT_SMS_TTL_MINUTES);
    }

    #[test]
    fn test_phone_number_rules() {
        assert!(is_valid_phone_number("+40721000000"));
        assert!(!is_valid_phone_number("40721000000"));
        assert!(!is_valid_phone_number("+4072-100"));
        assert!(!is_valid_phone_number("+0721000000"));
        assert!(!is_valid_phone_number("+123"));
    }

    #[test]
    fn test_empty_message_and_zero_ttl_rejected() {
        assert!(SmsPayload::new("+40721000000", " ").validate().is_err());
        assert!(SmsPayload::new("+40721000000", "hi")
            .with_ttl_minutes(0)
            .validate()
            .is_err());
    }
}
