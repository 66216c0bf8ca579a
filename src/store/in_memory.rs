//! # In-Memory Record Store
//!
//! `DashMap`-backed [`RecordStore`] for tests and local development. Each
//! conditional update runs while holding the record's shard lock, which gives
//! the same single-winner guarantee as the conditional `UPDATE` in PostgreSQL.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tracing::debug;

use super::traits::{RecordStore, EXPIRED_MESSAGE};
use crate::channels::DispatchPayload;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{DispatchRecord, NewDispatchRecord, RecordFilter, RecordId};
use crate::state_machine::DispatchStatus;

#[derive(Debug)]
pub struct InMemoryRecordStore<P> {
    records: DashMap<RecordId, DispatchRecord<P>>,
    failing: AtomicBool,
    failing_operations: DashSet<&'static str>,
    claim_attempts: AtomicU64,
}

impl<P: DispatchPayload> Default for InMemoryRecordStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DispatchPayload> InMemoryRecordStore<P> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            failing: AtomicBool::new(false),
            failing_operations: DashSet::new(),
            claim_attempts: AtomicU64::new(0),
        }
    }

    /// Make every operation fail with a storage error (simulated outage)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make a single operation (by trait method name) fail while the rest work
    pub fn fail_operation(&self, operation: &'static str) {
        self.failing_operations.insert(operation);
    }

    pub fn restore_operation(&self, operation: &str) {
        self.failing_operations.remove(operation);
    }

    /// Seed a record as-is, bypassing validation and defaults
    pub fn insert_record(&self, record: DispatchRecord<P>) {
        self.records.insert(record.id, record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of `claim_for_processing` calls, successful or not
    pub fn claim_attempts(&self) -> u64 {
        self.claim_attempts.load(Ordering::Relaxed)
    }

    fn check_available(&self, operation: &str) -> DispatchResult<()> {
        if self.failing.load(Ordering::SeqCst) || self.failing_operations.contains(operation) {
            Err(DispatchError::storage(operation, "in-memory store unavailable"))
        } else {
            Ok(())
        }
    }

    fn sorted(mut records: Vec<DispatchRecord<P>>) -> Vec<DispatchRecord<P>> {
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    fn page(records: Vec<DispatchRecord<P>>, limit: i64, offset: i64) -> Vec<DispatchRecord<P>> {
        let offset = usize::try_from(offset).unwrap_or(0);
        let limit = usize::try_from(limit).unwrap_or(0);
        records.into_iter().skip(offset).take(limit).collect()
    }
}

#[async_trait]
impl<P: DispatchPayload> RecordStore<P> for InMemoryRecordStore<P> {
    async fn create(&self, new_record: NewDispatchRecord<P>) -> DispatchResult<DispatchRecord<P>> {
        new_record.payload.validate()?;
        self.check_available("create")?;

        let record = DispatchRecord::from_new(new_record, Utc::now());
        self.records.insert(record.id, record.clone());
        debug!(record_id = %record.id, channel = P::CHANNEL, "Created dispatch record");
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> DispatchResult<DispatchRecord<P>> {
        self.check_available("get")?;
        self.records
            .get(&id)
            .map(|record| record.clone())
            .ok_or(DispatchError::NotFound(id))
    }

    async fn list(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> DispatchResult<Vec<DispatchRecord<P>>> {
        self.check_available("list")?;
        let matching = self
            .records
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::page(Self::sorted(matching), limit, offset))
    }

    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> DispatchResult<Vec<DispatchRecord<P>>> {
        self.check_available("list_pending")?;
        let pending = self
            .records
            .iter()
            .filter(|entry| {
                entry.status == DispatchStatus::Pending && entry.created_at < older_than
            })
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::page(Self::sorted(pending), limit, offset))
    }

    async fn set_status(
        &self,
        id: RecordId,
        status: DispatchStatus,
        error_message: Option<String>,
    ) -> DispatchResult<DispatchRecord<P>> {
        self.check_available("set_status")?;
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(DispatchError::NotFound(id))?;

        let now = Utc::now();
        record.status = status;
        record.last_updated_at = now;
        match status {
            DispatchStatus::Sent => {
                record.sent_at = Some(now);
                record.error_message = None;
            }
            DispatchStatus::Retry => {
                record.retry_count += 1;
            }
            _ => {}
        }
        if status != DispatchStatus::Sent && error_message.is_some() {
            record.error_message = error_message;
        }
        Ok(record.clone())
    }

    async fn mark_queued(&self, id: RecordId) -> DispatchResult<bool> {
        self.check_available("mark_queued")?;
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(false);
        };
        if record.status != DispatchStatus::Pending {
            return Ok(false);
        }
        record.status = DispatchStatus::Queued;
        record.last_updated_at = Utc::now();
        Ok(true)
    }

    async fn claim_for_processing(
        &self,
        id: RecordId,
    ) -> DispatchResult<Option<DispatchRecord<P>>> {
        self.claim_attempts.fetch_add(1, Ordering::Relaxed);
        self.check_available("claim_for_processing")?;

        let now = Utc::now();
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(None);
        };
        if !record.status.is_claimable() || record.is_expired_at(now) {
            return Ok(None);
        }
        record.status = DispatchStatus::Sending;
        record.last_updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn expire_if_due(&self, id: RecordId, now: DateTime<Utc>) -> DispatchResult<bool> {
        self.check_available("expire_if_due")?;
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(false);
        };
        if !record.status.is_expirable() || !record.is_expired_at(now) {
            return Ok(false);
        }
        record.status = DispatchStatus::Expired;
        record.last_updated_at = now;
        record.error_message = Some(EXPIRED_MESSAGE.to_string());
        Ok(true)
    }

    async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<RecordId>> {
        self.check_available("expire_overdue")?;
        let limit = usize::try_from(limit).unwrap_or(0);
        let candidates: Vec<RecordId> = self
            .records
            .iter()
            .filter(|entry| entry.status.is_expirable() && entry.is_expired_at(now))
            .map(|entry| entry.id)
            .take(limit)
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.expire_if_due(id, now).await? {
                expired.push(id);
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{EmailPayload, SmsPayload};
    use std::sync::Arc;

    fn email() -> NewDispatchRecord<EmailPayload> {
        NewDispatchRecord::new(EmailPayload::new("ops@example.com", "Alarm", "<p>x</p>"))
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_payload_without_persisting() {
        let store = InMemoryRecordStore::new();
        let err = store
            .create(NewDispatchRecord::new(EmailPayload::new("", "s", "b")))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryRecordStore::<EmailPayload>::new();
        let id = RecordId::new();
        assert!(matches!(store.get(id).await, Err(DispatchError::NotFound(missing)) if missing == id));
    }

    #[tokio::test]
    async fn test_claim_is_single_winner() {
        let store = Arc::new(InMemoryRecordStore::new());
        let record = store.create(email()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.claim_for_processing(record.id).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get(record.id).await.unwrap().status, DispatchStatus::Sending);
    }

    #[tokio::test]
    async fn test_terminal_records_are_not_claimable() {
        let store = InMemoryRecordStore::new();
        let record = store.create(email()).await.unwrap();
        store
            .set_status(record.id, DispatchStatus::Sent, None)
            .await
            .unwrap();
        assert!(store.claim_for_processing(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_status_side_effects() {
        let store = InMemoryRecordStore::new();
        let record = store.create(email()).await.unwrap();

        let retried = store
            .set_status(record.id, DispatchStatus::Retry, Some("smtp timeout".into()))
            .await
            .unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.error_message.as_deref(), Some("smtp timeout"));

        let failed = store
            .set_status(record.id, DispatchStatus::Failed, Some("mailbox full".into()))
            .await
            .unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("mailbox full"));

        let sent = store
            .set_status(record.id, DispatchStatus::Sent, None)
            .await
            .unwrap();
        assert!(sent.sent_at.is_some());
        assert!(sent.error_message.is_none());
    }

    #[tokio::test]
    async fn test_mark_queued_only_from_pending() {
        let store = InMemoryRecordStore::new();
        let record = store.create(email()).await.unwrap();
        store.claim_for_processing(record.id).await.unwrap();

        assert!(!store.mark_queued(record.id).await.unwrap());
        assert_eq!(store.get(record.id).await.unwrap().status, DispatchStatus::Sending);
    }

    #[tokio::test]
    async fn test_expired_record_cannot_be_claimed() {
        let store = InMemoryRecordStore::new();
        let mut record = DispatchRecord::from_new(
            NewDispatchRecord::new(SmsPayload::new("+40721000000", "Door open")),
            Utc::now() - chrono::Duration::minutes(10),
        );
        record.status = DispatchStatus::Queued;
        let id = record.id;
        store.insert_record(record);

        assert!(store.claim_for_processing(id).await.unwrap().is_none());
        assert_eq!(store.expire_overdue(Utc::now(), 10).await.unwrap(), vec![id]);
        assert_eq!(store.get(id).await.unwrap().status, DispatchStatus::Expired);
        assert!(!store.expire_if_due(id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_pending_oldest_first() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for minutes_ago in [3, 10, 6] {
            let record = DispatchRecord::from_new(email(), now - chrono::Duration::minutes(minutes_ago));
            ids.push((minutes_ago, record.id));
            store.insert_record(record);
        }

        let pending = store
            .list_pending(now - chrono::Duration::minutes(5), 10, 0)
            .await
            .unwrap();
        let listed: Vec<RecordId> = pending.iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![ids[1].1, ids[2].1]);
    }

    #[tokio::test]
    async fn test_failing_store_surfaces_storage_errors() {
        let store = InMemoryRecordStore::<EmailPayload>::new();
        store.set_failing(true);
        let err = store.claim_for_processing(RecordId::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
