//! # Dispatch Record Model
//!
//! A dispatch record is one persisted unit of outbound work: one email, one
//! SMS, one relayed event. The record is the source of truth for delivery
//! state; queue messages only ever carry its [`RecordId`].
//!
//! ## Database Schema
//!
//! Maps to the `dispatch_records` table:
//! ```sql
//! CREATE TABLE dispatch_records (
//!   id UUID PRIMARY KEY,
//!   channel VARCHAR(32) NOT NULL,
//!   status VARCHAR(16) NOT NULL,
//!   retry_count INTEGER NOT NULL DEFAULT 0,
//!   max_retry_count INTEGER NOT NULL DEFAULT 3,
//!   error_message TEXT,
//!   payload JSONB NOT NULL,
//!   created_at TIMESTAMPTZ NOT NULL,
//!   last_updated_at TIMESTAMPTZ NOT NULL,
//!   sent_at TIMESTAMPTZ,
//!   expires_at TIMESTAMPTZ
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::channels::DispatchPayload;
use crate::state_machine::DispatchStatus;

/// Default retry budget for new records
pub const DEFAULT_MAX_RETRY_COUNT: i32 = 3;

/// Opaque, immutable record identifier (UUID v7, time ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A persisted dispatch record for channel payload `P`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord<P> {
    pub id: RecordId,
    pub channel: String,
    pub status: DispatchStatus,
    pub retry_count: i32,
    pub max_retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    /// `created_at + ttl` for time-sensitive channels
    pub expires_at: Option<DateTime<Utc>>,
    pub payload: P,
}

impl<P: DispatchPayload> DispatchRecord<P> {
    /// Build a fresh `Pending` record with server-assigned id and timestamps
    pub fn from_new(new_record: NewDispatchRecord<P>, now: DateTime<Utc>) -> Self {
        let expires_at = new_record
            .payload
            .time_to_live()
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        Self {
            id: RecordId::new(),
            channel: P::CHANNEL.to_string(),
            status: DispatchStatus::Pending,
            retry_count: 0,
            max_retry_count: new_record
                .max_retry_count
                .unwrap_or(DEFAULT_MAX_RETRY_COUNT),
            error_message: None,
            created_at: now,
            last_updated_at: now,
            sent_at: None,
            expires_at,
            payload: new_record.payload,
        }
    }
}

impl<P> DispatchRecord<P> {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn status_message(&self) -> &'static str {
        self.status.description()
    }
}

/// Producer input for creating a record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDispatchRecord<P> {
    pub payload: P,
    /// Defaults to [`DEFAULT_MAX_RETRY_COUNT`]
    pub max_retry_count: Option<i32>,
}

impl<P> NewDispatchRecord<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            max_retry_count: None,
        }
    }

    pub fn with_max_retry_count(mut self, max_retry_count: i32) -> Self {
        self.max_retry_count = Some(max_retry_count);
        self
    }
}

/// Read-side filter for callers polling record status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub status: Option<DispatchStatus>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn with_status(mut self, status: DispatchStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_to = Some(to);
        self
    }

    pub fn matches<P>(&self, record: &DispatchRecord<P>) -> bool {
        self.status.map_or(true, |status| record.status == status)
            && self.created_from.map_or(true, |from| record.created_at >= from)
            && self.created_to.map_or(true, |to| record.created_at <= to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{EmailPayload, SmsPayload};

    #[test]
    fn test_new_record_defaults() {
        let now = Utc::now();
        let record = DispatchRecord::from_new(
            NewDispatchRecord::new(EmailPayload::new("ops@example.com", "Alarm", "<p>hi</p>")),
            now,
        );

        assert_eq!(record.status, DispatchStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
        assert_eq!(record.channel, "email");
        assert!(record.expires_at.is_none());
        assert!(!record.is_expired_at(now + chrono::Duration::days(365)));
    }

    #[test]
    fn test_time_sensitive_record_gets_expiry() {
        let now = Utc::now();
        let record = DispatchRecord::from_new(
            NewDispatchRecord::new(SmsPayload::new("+40721000000", "Door open").with_ttl_minutes(5)),
            now,
        );

        assert_eq!(record.expires_at, Some(now + chrono::Duration::minutes(5)));
        assert!(!record.is_expired_at(now + chrono::Duration::minutes(4)));
        assert!(record.is_expired_at(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_record_ids_are_unique_and_parse() {
        let a = RecordId::new();
        let b = RecordId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<RecordId>().unwrap(), a);
    }

    #[test]
    fn test_filter_matching() {
        let now = Utc::now();
        let record = DispatchRecord::from_new(
            NewDispatchRecord::new(EmailPayload::new("ops@example.com", "s", "b")),
            now,
        );

        assert!(RecordFilter::default().matches(&record));
        assert!(RecordFilter::default()
            .with_status(DispatchStatus::Pending)
            .matches(&record));
        assert!(!RecordFilter::default()
            .with_status(DispatchStatus::Sent)
            .matches(&record));
        assert!(!RecordFilter::default()
            .created_between(now + chrono::Duration::seconds(1), now + chrono::Duration::hours(1))
            .matches(&record));
    }
}
