//! # PostgreSQL Record Store
//!
//! [`RecordStore`] over the `dispatch_records` table. Every query is scoped to
//! the payload's channel, so one table serves all pipelines.
//!
//! The claim is a single conditional `UPDATE ... RETURNING`:
//!
//! ```sql
//! UPDATE dispatch_records
//!    SET status = 'sending', last_updated_at = now()
//!  WHERE id = $1 AND channel = $2
//!    AND status = ANY($3)
//!    AND (expires_at IS NULL OR expires_at > now())
//! RETURNING *
//! ```
//!
//! Row-level locking makes concurrent claimers serialize on the row; the
//! loser re-evaluates the `WHERE` clause against the committed `sending`
//! status and updates nothing.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::traits::{RecordStore, EXPIRED_MESSAGE};
use crate::channels::DispatchPayload;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{DispatchRecord, NewDispatchRecord, RecordFilter, RecordId};
use crate::state_machine::DispatchStatus;

const RECORD_COLUMNS: &str = "id, channel, status, retry_count, max_retry_count, error_message, \
     payload, created_at, last_updated_at, sent_at, expires_at";

#[derive(Debug, sqlx::FromRow)]
struct DispatchRecordRow {
    id: Uuid,
    channel: String,
    status: String,
    retry_count: i32,
    max_retry_count: i32,
    error_message: Option<String>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

impl DispatchRecordRow {
    fn into_record<P: DispatchPayload>(self) -> DispatchResult<DispatchRecord<P>> {
        let status = self.status.parse::<DispatchStatus>().map_err(|e| {
            DispatchError::storage("decode", format!("record {}: {e}", self.id))
        })?;
        let payload = serde_json::from_value::<P>(self.payload).map_err(|e| {
            DispatchError::storage("decode", format!("record {} payload: {e}", self.id))
        })?;

        Ok(DispatchRecord {
            id: RecordId::from_uuid(self.id),
            channel: self.channel,
            status,
            retry_count: self.retry_count,
            max_retry_count: self.max_retry_count,
            error_message: self.error_message,
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            sent_at: self.sent_at,
            expires_at: self.expires_at,
            payload,
        })
    }
}

fn status_strings(statuses: &[DispatchStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn storage_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> DispatchError {
    move |e| {
        error!(operation, error = %e, "Record store query failed");
        DispatchError::storage(operation, e.to_string())
    }
}

#[derive(Debug)]
pub struct PgRecordStore<P> {
    pool: PgPool,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for PgRecordStore<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P: DispatchPayload> PgRecordStore<P> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _payload: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Apply the bundled schema migrations
pub async fn run_migrations(pool: &PgPool) -> DispatchResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| DispatchError::storage("migrate", e.to_string()))
}

#[async_trait]
impl<P: DispatchPayload> RecordStore<P> for PgRecordStore<P> {
    #[instrument(skip(self, new_record), fields(channel = P::CHANNEL))]
    async fn create(&self, new_record: NewDispatchRecord<P>) -> DispatchResult<DispatchRecord<P>> {
        new_record.payload.validate()?;
        let record = DispatchRecord::from_new(new_record, Utc::now());
        let payload = serde_json::to_value(&record.payload)?;

        let query = format!(
            "INSERT INTO dispatch_records ({RECORD_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DispatchRecordRow>(&query)
            .bind(record.id.as_uuid())
            .bind(&record.channel)
            .bind(record.status.as_str())
            .bind(record.retry_count)
            .bind(record.max_retry_count)
            .bind(&record.error_message)
            .bind(payload)
            .bind(record.created_at)
            .bind(record.last_updated_at)
            .bind(record.sent_at)
            .bind(record.expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error("create"))?;

        debug!(record_id = %record.id, "Created dispatch record");
        row.into_record()
    }

    async fn get(&self, id: RecordId) -> DispatchResult<DispatchRecord<P>> {
        let query =
            format!("SELECT {RECORD_COLUMNS} FROM dispatch_records WHERE id = $1 AND channel = $2");
        sqlx::query_as::<_, DispatchRecordRow>(&query)
            .bind(id.as_uuid())
            .bind(P::CHANNEL)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error("get"))?
            .ok_or(DispatchError::NotFound(id))?
            .into_record()
    }

    async fn list(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> DispatchResult<Vec<DispatchRecord<P>>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM dispatch_records \
             WHERE channel = $1 \
               AND ($2::text IS NULL OR status = $2) \
               AND ($3::timestamptz IS NULL OR created_at >= $3) \
               AND ($4::timestamptz IS NULL OR created_at <= $4) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $5 OFFSET $6"
        );
        let rows = sqlx::query_as::<_, DispatchRecordRow>(&query)
            .bind(P::CHANNEL)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.created_from)
            .bind(filter.created_to)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error("list"))?;

        rows.into_iter().map(DispatchRecordRow::into_record).collect()
    }

    async fn list_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> DispatchResult<Vec<DispatchRecord<P>>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM dispatch_records \
             WHERE channel = $1 AND status = $2 AND created_at < $3 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $4 OFFSET $5"
        );
        let rows = sqlx::query_as::<_, DispatchRecordRow>(&query)
            .bind(P::CHANNEL)
            .bind(DispatchStatus::Pending.as_str())
            .bind(older_than)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error("list_pending"))?;

        rows.into_iter().map(DispatchRecordRow::into_record).collect()
    }

    #[instrument(skip(self, error_message), fields(channel = P::CHANNEL))]
    async fn set_status(
        &self,
        id: RecordId,
        status: DispatchStatus,
        error_message: Option<String>,
    ) -> DispatchResult<DispatchRecord<P>> {
        let query = format!(
            "UPDATE dispatch_records SET \
               status = $3, \
               last_updated_at = now(), \
               sent_at = CASE WHEN $3 = 'sent' THEN now() ELSE sent_at END, \
               error_message = CASE WHEN $3 = 'sent' THEN NULL \
                                    ELSE COALESCE($4, error_message) END, \
               retry_count = CASE WHEN $3 = 'retry' THEN retry_count + 1 \
                                  ELSE retry_count END \
             WHERE id = $1 AND channel = $2 \
             RETURNING {RECORD_COLUMNS}"
        );
        sqlx::query_as::<_, DispatchRecordRow>(&query)
            .bind(id.as_uuid())
            .bind(P::CHANNEL)
            .bind(status.as_str())
            .bind(error_message)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error("set_status"))?
            .ok_or(DispatchError::NotFound(id))?
            .into_record()
    }

    async fn mark_queued(&self, id: RecordId) -> DispatchResult<bool> {
        let result = sqlx::query(
            "UPDATE dispatch_records SET status = $3, last_updated_at = now() \
             WHERE id = $1 AND channel = $2 AND status = $4",
        )
        .bind(id.as_uuid())
        .bind(P::CHANNEL)
        .bind(DispatchStatus::Queued.as_str())
        .bind(DispatchStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_error("mark_queued"))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(channel = P::CHANNEL))]
    async fn claim_for_processing(
        &self,
        id: RecordId,
    ) -> DispatchResult<Option<DispatchRecord<P>>> {
        let query = format!(
            "UPDATE dispatch_records SET status = $3, last_updated_at = now() \
             WHERE id = $1 AND channel = $2 \
               AND status = ANY($4) \
               AND (expires_at IS NULL OR expires_at > now()) \
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DispatchRecordRow>(&query)
            .bind(id.as_uuid())
            .bind(P::CHANNEL)
            .bind(DispatchStatus::Sending.as_str())
            .bind(status_strings(&DispatchStatus::CLAIMABLE))
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error("claim_for_processing"))?;

        row.map(DispatchRecordRow::into_record).transpose()
    }

    async fn expire_if_due(&self, id: RecordId, now: DateTime<Utc>) -> DispatchResult<bool> {
        let result = sqlx::query(
            "UPDATE dispatch_records \
                SET status = $3, last_updated_at = $4, error_message = $5 \
              WHERE id = $1 AND channel = $2 \
                AND status = ANY($6) \
                AND expires_at IS NOT NULL AND expires_at <= $4",
        )
        .bind(id.as_uuid())
        .bind(P::CHANNEL)
        .bind(DispatchStatus::Expired.as_str())
        .bind(now)
        .bind(EXPIRED_MESSAGE)
        .bind(status_strings(&DispatchStatus::EXPIRABLE))
        .execute(&self.pool)
        .await
        .map_err(storage_error("expire_if_due"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<RecordId>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE dispatch_records \
                SET status = $2, last_updated_at = $3, error_message = $4 \
              WHERE id IN ( \
                    SELECT id FROM dispatch_records \
                     WHERE channel = $1 AND status = ANY($5) \
                       AND expires_at IS NOT NULL AND expires_at <= $3 \
                     ORDER BY expires_at ASC \
                     LIMIT $6 \
                     FOR UPDATE SKIP LOCKED) \
             RETURNING id",
        )
        .bind(P::CHANNEL)
        .bind(DispatchStatus::Expired.as_str())
        .bind(now)
        .bind(EXPIRED_MESSAGE)
        .bind(status_strings(&DispatchStatus::EXPIRABLE))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("expire_overdue"))?;

        Ok(ids.into_iter().map(|(id,)| RecordId::from_uuid(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{EmailPayload, SmsPayload};

    fn email() -> NewDispatchRecord<EmailPayload> {
        NewDispatchRecord::new(EmailPayload::new("ops@example.com", "Alarm", "<p>x</p>"))
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL"]
    async fn test_create_and_get(pool: PgPool) {
        let store = PgRecordStore::<EmailPayload>::new(pool);
        let created = store.create(email().with_max_retry_count(5)).await.unwrap();

        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched.status, DispatchStatus::Pending);
        assert_eq!(fetched.max_retry_count, 5);
        assert_eq!(fetched.payload.to_email, "ops@example.com");
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL"]
    async fn test_channel_scoping(pool: PgPool) {
        let email_store = PgRecordStore::<EmailPayload>::new(pool.clone());
        let sms_store = PgRecordStore::<SmsPayload>::new(pool);
        let created = email_store.create(email()).await.unwrap();

        assert!(matches!(
            sms_store.get(created.id).await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL"]
    async fn test_concurrent_claims_have_one_winner(pool: PgPool) {
        let store = PgRecordStore::<EmailPayload>::new(pool);
        let created = store.create(email()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_for_processing(created.id).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL"]
    async fn test_retry_then_failed_counts(pool: PgPool) {
        let store = PgRecordStore::<EmailPayload>::new(pool);
        let created = store.create(email()).await.unwrap();

        let retried = store
            .set_status(created.id, DispatchStatus::Retry, Some("timeout".into()))
            .await
            .unwrap();
        assert_eq!(retried.retry_count, 1);

        let claimed = store.claim_for_processing(created.id).await.unwrap();
        assert!(claimed.is_some(), "retry records are claimable");

        let failed = store
            .set_status(created.id, DispatchStatus::Failed, Some("bounced".into()))
            .await
            .unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("bounced"));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL"]
    async fn test_expire_overdue_and_pending_listing(pool: PgPool) {
        let store = PgRecordStore::<SmsPayload>::new(pool);
        let created = store
            .create(NewDispatchRecord::new(
                SmsPayload::new("+40721000000", "Door open").with_ttl_minutes(1),
            ))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::minutes(2);
        let pending = store.list_pending(later, 10, 0).await.unwrap();
        assert_eq!(pending.len(), 1);

        let expired = store.expire_overdue(later, 10).await.unwrap();
        assert_eq!(expired, vec![created.id]);
        assert_eq!(
            store.get(created.id).await.unwrap().status,
            DispatchStatus::Expired
        );
        assert!(store.list_pending(later, 10, 0).await.unwrap().is_empty());
    }
}
