//! Producer-facing entry point: create a record and publish it right away.

use std::sync::Arc;

use tracing::{instrument, warn};

use super::publisher::Publisher;
use crate::channels::DispatchPayload;
use crate::error::{DispatchError, DispatchResult};
use crate::logging::log_record_operation;
use crate::models::{DispatchRecord, NewDispatchRecord, RecordFilter, RecordId};
use crate::store::RecordStore;

/// Largest page `list` will return
pub const MAX_PAGE_SIZE: i64 = 1_000;

pub struct DispatchService<P, S> {
    store: Arc<S>,
    publisher: Arc<Publisher<P, S>>,
    default_max_retry_count: i32,
}

impl<P, S> std::fmt::Debug for DispatchService<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService")
            .field("default_max_retry_count", &self.default_max_retry_count)
            .finish()
    }
}

impl<P: DispatchPayload, S: RecordStore<P>> DispatchService<P, S> {
    pub fn new(
        store: Arc<S>,
        publisher: Arc<Publisher<P, S>>,
        default_max_retry_count: i32,
    ) -> Self {
        Self {
            store,
            publisher,
            default_max_retry_count,
        }
    }

    /// Persist a record and attempt the first publish. A failed publish is not
    /// an error: the record stays `Pending` and the sweeper picks it up.
    #[instrument(skip(self, new_record), fields(channel = P::CHANNEL))]
    pub async fn create(
        &self,
        mut new_record: NewDispatchRecord<P>,
    ) -> DispatchResult<DispatchRecord<P>> {
        match new_record.max_retry_count {
            Some(max) if max < 0 => {
                return Err(DispatchError::validation(
                    "max_retry_count must not be negative",
                ))
            }
            Some(_) => {}
            None => new_record.max_retry_count = Some(self.default_max_retry_count),
        }

        let record = self.store.create(new_record).await?;
        let published = self.publisher.publish(record.id).await;
        let record = match self.store.get(record.id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(
                    record_id = %record.id,
                    error = %e,
                    "Re-reading created record failed, returning it as created"
                );
                record
            }
        };
        log_record_operation(
            "create",
            P::CHANNEL,
            record.id,
            record.status.as_str(),
            (!published).then_some("publish deferred to reconciliation"),
        );

        Ok(record)
    }

    pub async fn get(&self, id: RecordId) -> DispatchResult<DispatchRecord<P>> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> DispatchResult<Vec<DispatchRecord<P>>> {
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(DispatchError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if offset < 0 {
            return Err(DispatchError::validation("offset must not be negative"));
        }
        if let (Some(from), Some(to)) = (filter.created_from, filter.created_to) {
            if from > to {
                return Err(DispatchError::validation(
                    "created_from must not be after created_to",
                ));
            }
        }
        self.store.list(filter, limit, offset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::EmailPayload;
    use crate::messaging::providers::in_memory::{InMemoryBroker, InMemoryConnector};
    use crate::messaging::{BrokerConnector, ConnectionManager, QueueTopology, ReconnectPolicy};
    use crate::state_machine::DispatchStatus;
    use crate::store::InMemoryRecordStore;
    use std::time::Duration;

    fn service(
        store: &Arc<InMemoryRecordStore<EmailPayload>>,
    ) -> DispatchService<EmailPayload, InMemoryRecordStore<EmailPayload>> {
        let topology = QueueTopology::new(
            "svc.dispatch",
            "svc.dispatch.main",
            "main",
            Duration::from_millis(50),
        );
        let connector: Arc<dyn BrokerConnector> =
            Arc::new(InMemoryConnector::new(Arc::new(InMemoryBroker::new())));
        let connections = Arc::new(
            ConnectionManager::new(connector, ReconnectPolicy::default())
                .with_topology(topology.clone()),
        );
        let publisher = Arc::new(Publisher::new(Arc::clone(store), connections, topology));
        DispatchService::new(Arc::clone(store), publisher, 3)
    }

    fn email() -> NewDispatchRecord<EmailPayload> {
        NewDispatchRecord::new(EmailPayload::new("ops@example.com", "Alarm", "<p>!</p>"))
    }

    #[tokio::test]
    async fn test_create_publishes_and_returns_queued_record() {
        let store = Arc::new(InMemoryRecordStore::new());
        let record = service(&store).create(email()).await.unwrap();
        assert_eq!(record.status, DispatchStatus::Queued);
        assert_eq!(record.max_retry_count, 3);
    }

    #[tokio::test]
    async fn test_create_survives_failed_reread() {
        let store = Arc::new(InMemoryRecordStore::new());
        let service = service(&store);

        store.fail_operation("get");
        let record = service.create(email()).await.unwrap();
        store.restore_operation("get");

        // Returned as created; the store already moved it on
        assert_eq!(record.status, DispatchStatus::Pending);
        assert_eq!(
            store.get(record.id).await.unwrap().status,
            DispatchStatus::Queued
        );
    }
}
