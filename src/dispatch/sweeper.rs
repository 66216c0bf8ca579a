//! # Reconciliation Sweeper
//!
//! Periodic safety net for records whose queue message never reached the
//! broker. Each sweep:
//!
//! 1. expires time-sensitive records whose time-to-live has elapsed
//! 2. republishes records still `Pending` after `pending_threshold`
//!
//! A sweep stops between records once shutdown is requested; the record being
//! published at that moment is finished first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::publisher::Publisher;
use crate::channels::DispatchPayload;
use crate::store::RecordStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperSettings {
    pub enabled: bool,
    pub interval: Duration,
    /// Only records pending for longer than this are republished
    pub pending_threshold: Duration,
    pub batch_size: i64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            pending_threshold: Duration::from_secs(5 * 60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: usize,
    pub republished: usize,
    pub failed: usize,
    /// Shutdown interrupted the republish pass
    pub cancelled: bool,
}

#[derive(Debug, Default)]
pub struct SweeperStats {
    pub sweeps: AtomicU64,
    pub expired: AtomicU64,
    pub republished: AtomicU64,
    pub publish_failures: AtomicU64,
    pub sweep_errors: AtomicU64,
}

pub struct ReconciliationSweeper<P, S> {
    store: Arc<S>,
    publisher: Arc<Publisher<P, S>>,
    settings: SweeperSettings,
    stats: Arc<SweeperStats>,
}

impl<P, S> std::fmt::Debug for ReconciliationSweeper<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationSweeper")
            .field("settings", &self.settings)
            .field("stats", &self.stats)
            .finish()
    }
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

impl<P: DispatchPayload, S: RecordStore<P>> ReconciliationSweeper<P, S> {
    pub fn new(store: Arc<S>, publisher: Arc<Publisher<P, S>>, settings: SweeperSettings) -> Self {
        Self {
            store,
            publisher,
            settings,
            stats: Arc::new(SweeperStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SweeperStats> {
        Arc::clone(&self.stats)
    }

    /// Sweep on a fixed interval until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        if !self.settings.enabled {
            info!(channel = P::CHANNEL, "Reconciliation sweeper disabled by configuration");
            return;
        }

        info!(
            channel = P::CHANNEL,
            interval = ?self.settings.interval,
            pending_threshold = ?self.settings.pending_threshold,
            batch_size = self.settings.batch_size,
            "Reconciliation sweeper starting"
        );

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; sweep one full interval after start.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    let report = self
                        .sweep_until(|| shutdown_requested(&mut shutdown))
                        .await;
                    if report.cancelled {
                        break;
                    }
                }
            }
        }

        info!(channel = P::CHANNEL, "Reconciliation sweeper stopped");
    }

    /// One complete sweep, never cancelled
    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_until(|| false).await
    }

    async fn sweep_until(&self, mut should_stop: impl FnMut() -> bool) -> SweepReport {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = SweepReport::default();
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);

        match self.store.expire_overdue(now, self.settings.batch_size).await {
            Ok(expired) => {
                report.expired = expired.len();
                self.stats
                    .expired
                    .fetch_add(expired.len() as u64, Ordering::Relaxed);
                for id in &expired {
                    info!(record_id = %id, channel = P::CHANNEL, "Expired overdue record");
                }
            }
            Err(e) => {
                self.stats.sweep_errors.fetch_add(1, Ordering::Relaxed);
                error!(channel = P::CHANNEL, error = %e, "Expiry pass failed");
            }
        }

        let threshold = chrono::Duration::from_std(self.settings.pending_threshold)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let pending = match self
            .store
            .list_pending(now - threshold, self.settings.batch_size, 0)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                self.stats.sweep_errors.fetch_add(1, Ordering::Relaxed);
                error!(channel = P::CHANNEL, error = %e, "Pending scan failed");
                return report;
            }
        };

        for record in pending {
            if should_stop() {
                report.cancelled = true;
                debug!(channel = P::CHANNEL, "Sweep interrupted by shutdown");
                break;
            }
            if self.publisher.publish(record.id).await {
                report.republished += 1;
                self.stats.republished.fetch_add(1, Ordering::Relaxed);
            } else {
                report.failed += 1;
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        if report.expired > 0 || report.republished > 0 || report.failed > 0 {
            info!(
                channel = P::CHANNEL,
                expired = report.expired,
                republished = report.republished,
                failed = report.failed,
                duration_ms = started.elapsed().as_millis() as u64,
                "Reconciliation sweep completed"
            );
        } else {
            debug!(channel = P::CHANNEL, "Reconciliation sweep found nothing to do");
        }
        if report.failed > 0 {
            warn!(
                channel = P::CHANNEL,
                failed = report.failed,
                "Some pending records could not be republished"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::EmailPayload;
    use crate::messaging::providers::in_memory::{InMemoryBroker, InMemoryConnector};
    use crate::messaging::{BrokerConnector, ConnectionManager, QueueTopology, ReconnectPolicy};
    use crate::models::{DispatchRecord, NewDispatchRecord, RecordFilter, RecordId};
    use crate::state_machine::DispatchStatus;
    use crate::store::InMemoryRecordStore;

    type Store = InMemoryRecordStore<EmailPayload>;

    fn sweeper(store: &Arc<Store>, interval: Duration) -> ReconciliationSweeper<EmailPayload, Store> {
        let topology = QueueTopology::new(
            "sweep.dispatch",
            "sweep.dispatch.main",
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
        ReconciliationSweeper::new(
            Arc::clone(store),
            publisher,
            SweeperSettings {
                enabled: true,
                interval,
                pending_threshold: Duration::from_secs(60),
                batch_size: 100,
            },
        )
    }

    /// A `Pending` record created an hour ago
    fn seed_stale(store: &Store) -> RecordId {
        let record = DispatchRecord::from_new(
            NewDispatchRecord::new(EmailPayload::new("ops@example.com", "Alarm", "<p>!</p>")),
            Utc::now() - chrono::Duration::hours(1),
        );
        let id = record.id;
        store.insert_record(record);
        id
    }

    async fn count_with_status(store: &Store, status: DispatchStatus) -> usize {
        store
            .list(&RecordFilter::default().with_status(status), 100, 0)
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_sweep_republishes_stale_pending_records() {
        let store = Arc::new(Store::new());
        let id = seed_stale(&store);
        store
            .create(NewDispatchRecord::new(EmailPayload::new("a@example.com", "Fresh", "<p/>")))
            .await
            .unwrap();

        let report = sweeper(&store, Duration::from_secs(60)).sweep_once().await;

        assert_eq!(report.republished, 1);
        assert!(!report.cancelled);
        assert_eq!(store.get(id).await.unwrap().status, DispatchStatus::Queued);
        assert_eq!(count_with_status(&store, DispatchStatus::Pending).await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweep_between_records() {
        let store = Arc::new(Store::new());
        for _ in 0..5 {
            seed_stale(&store);
        }
        let sweeper = sweeper(&store, Duration::from_secs(60));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        // Signal shutdown once the first record has been published
        let mut checks = 0;
        let report = sweeper
            .sweep_until(|| {
                if checks == 1 {
                    let _ = shutdown_tx.send(());
                }
                checks += 1;
                shutdown_requested(&mut shutdown_rx)
            })
            .await;

        assert!(report.cancelled);
        assert_eq!(report.republished, 1);
        assert_eq!(count_with_status(&store, DispatchStatus::Queued).await, 1);
        assert_eq!(count_with_status(&store, DispatchStatus::Pending).await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sweep_runs_one_interval_after_start() {
        let store = Arc::new(Store::new());
        let id = seed_stale(&store);
        let sweeper = Arc::new(sweeper(&store, Duration::from_secs(60)));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = {
            let sweeper = Arc::clone(&sweeper);
            tokio::spawn(async move { sweeper.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(sweeper.stats().sweeps.load(Ordering::Relaxed), 0);
        assert_eq!(store.get(id).await.unwrap().status, DispatchStatus::Pending);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sweeper.stats().sweeps.load(Ordering::Relaxed), 1);
        assert_eq!(store.get(id).await.unwrap().status, DispatchStatus::Queued);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_sweeper_returns_immediately() {
        let store = Arc::new(Store::new());
        let id = seed_stale(&store);
        let mut sweeper = sweeper(&store, Duration::from_millis(1));
        sweeper.settings.enabled = false;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        sweeper.run(shutdown_rx).await;

        assert_eq!(sweeper.stats().sweeps.load(Ordering::Relaxed), 0);
        assert_eq!(store.get(id).await.unwrap().status, DispatchStatus::Pending);
    }
}
