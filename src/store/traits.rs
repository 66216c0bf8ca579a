use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channels::DispatchPayload;
use crate::error::DispatchResult;
use crate::models::{DispatchRecord, NewDispatchRecord, RecordFilter, RecordId};
use crate::state_machine::DispatchStatus;

/// Message stored on records that expired before delivery
pub const EXPIRED_MESSAGE: &str = "time-to-live elapsed before delivery";

/// Durable storage of dispatch records for one channel payload type.
///
/// Cross-worker coordination relies entirely on the conditional operations
/// here: [`claim_for_processing`](Self::claim_for_processing),
/// [`mark_queued`](Self::mark_queued) and the expiry updates are single
/// compare-and-set writes, so two workers racing on one record cannot both win.
#[async_trait]
pub trait RecordStore<P: DispatchPayload>: Send + Sync + 'static {
    /// Validate and persist a new `Pending` record
    async fn create(&self, new_record: NewDispatchRecord<P>) -> DispatchResult<DispatchRecord<P>>;

    async fn get(&self, id: RecordId) -> DispatchResult<DispatchRecord<P>>;

    /// Records matching `filter`, oldest first
    async fn list(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> DispatchResult<Vec<DispatchRecord<P>>>;

    /// `Pending` records created before `older_than`, oldest first
    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> DispatchResult<Vec<DispatchRecord<P>>>;

    /// Unconditional status write by the record's current owner.
    ///
    /// `Sent` stamps `sent_at` and clears the error, `Retry` increments
    /// `retry_count`, every write refreshes `last_updated_at`.
    async fn set_status(
        &self,
        id: RecordId,
        status: DispatchStatus,
        error_message: Option<String>,
    ) -> DispatchResult<DispatchRecord<P>>;

    /// `Pending -> Queued` after a confirmed publish. Returns `false` when the
    /// record already moved on.
    async fn mark_queued(&self, id: RecordId) -> DispatchResult<bool>;

    /// Atomically move a claimable, unexpired record to `Sending`. `None` means
    /// someone else owns it, it is terminal or expired, or it does not exist.
    async fn claim_for_processing(&self, id: RecordId)
        -> DispatchResult<Option<DispatchRecord<P>>>;

    /// Expire one record if its time-to-live has elapsed at `now`
    async fn expire_if_due(&self, id: RecordId, now: DateTime<Utc>) -> DispatchResult<bool>;

    /// Expire up to `limit` overdue records, returning their ids
    async fn expire_overdue(&self, now: DateTime<Utc>, limit: i64)
        -> DispatchResult<Vec<RecordId>>;
}
