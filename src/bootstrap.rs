//! # Dispatch Bootstrap
//!
//! Wires one channel's pipeline together and owns its background tasks:
//! the publishing side (service, publisher, sweeper) and the consuming side
//! (worker) each hold their own broker connection. Both connect with bounded
//! retries before anything is spawned, so an unreachable broker fails startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::channels::DispatchPayload;
use crate::config::DispatchConfig;
use crate::dispatch::{
    DispatchService, DispatchWorker, Publisher, ReconciliationSweeper, SweeperSettings,
    SweeperStats, Transport, WorkerSettings, WorkerStats,
};
use crate::error::{DispatchError, DispatchResult};
use crate::messaging::providers::rabbitmq::RabbitMqConnector;
use crate::messaging::{BrokerConnector, ConnectionManager, QueueTopology, ReconnectPolicy};
use crate::store::{run_migrations, PgRecordStore, RecordStore};

/// Everything needed to start a pipeline besides its store and broker
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub topology: QueueTopology,
    pub reconnect: ReconnectPolicy,
    pub worker: WorkerSettings,
    pub sweeper: SweeperSettings,
    pub default_max_retry_count: i32,
}

impl DispatchSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            topology: config.topology(),
            reconnect: config.reconnect_policy(),
            worker: config.worker_settings(),
            sweeper: config.sweeper_settings(),
            default_max_retry_count: config.records.default_max_retry_count,
        }
    }
}

/// Handle for a running pipeline
pub struct DispatchSystemHandle<P, S> {
    service: Arc<DispatchService<P, S>>,
    sweeper: Arc<ReconciliationSweeper<P, S>>,
    worker_stats: Arc<WorkerStats>,
    publish_connections: Arc<ConnectionManager>,
    shutdown_sender: Option<broadcast::Sender<()>>,
    worker_task: Option<JoinHandle<DispatchResult<()>>>,
    sweeper_task: Option<JoinHandle<()>>,
}

impl<P, S> std::fmt::Debug for DispatchSystemHandle<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchSystemHandle")
            .field("running", &self.shutdown_sender.is_some())
            .field("worker_stats", &self.worker_stats)
            .finish()
    }
}

impl<P: DispatchPayload, S: RecordStore<P>> DispatchSystemHandle<P, S> {
    pub fn service(&self) -> Arc<DispatchService<P, S>> {
        Arc::clone(&self.service)
    }

    pub fn sweeper(&self) -> Arc<ReconciliationSweeper<P, S>> {
        Arc::clone(&self.sweeper)
    }

    pub fn worker_stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.worker_stats)
    }

    pub fn sweeper_stats(&self) -> Arc<SweeperStats> {
        self.sweeper.stats()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_sender.is_some()
    }

    /// Signal shutdown and wait for the worker and sweeper to finish. The
    /// worker settles its in-flight delivery first.
    pub async fn shutdown(&mut self) -> DispatchResult<()> {
        let Some(sender) = self.shutdown_sender.take() else {
            warn!(channel = P::CHANNEL, "Dispatch system already stopped");
            return Ok(());
        };
        info!(channel = P::CHANNEL, "Dispatch system shutdown requested");
        // Receivers may already be gone if a task exited early
        let _ = sender.send(());

        let mut result = Ok(());
        if let Some(task) = self.worker_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(e) => result = Err(DispatchError::internal(format!("worker task: {e}"))),
            }
        }
        if let Some(task) = self.sweeper_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Sweeper task panicked");
            }
        }
        if let Err(e) = self.publish_connections.close().await {
            warn!(error = %e, "Closing publisher connection failed");
        }

        info!(channel = P::CHANNEL, "Dispatch system stopped");
        result
    }
}

/// Start a pipeline over an existing store and broker connector
pub async fn start<P, S, T>(
    store: Arc<S>,
    connector: Arc<dyn BrokerConnector>,
    transport: T,
    settings: DispatchSettings,
) -> DispatchResult<DispatchSystemHandle<P, S>>
where
    P: DispatchPayload,
    S: RecordStore<P>,
    T: Transport<P>,
{
    let connection_manager = || {
        Arc::new(
            ConnectionManager::new(Arc::clone(&connector), settings.reconnect.clone())
                .with_topology(settings.topology.clone()),
        )
    };

    let publish_connections = connection_manager();
    publish_connections.connect_on_startup().await?;
    let consume_connections = connection_manager();
    consume_connections.connect_on_startup().await?;

    let publisher = Arc::new(Publisher::new(
        Arc::clone(&store),
        Arc::clone(&publish_connections),
        settings.topology.clone(),
    ));
    let service = Arc::new(DispatchService::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        settings.default_max_retry_count,
    ));
    let sweeper = Arc::new(ReconciliationSweeper::new(
        Arc::clone(&store),
        publisher,
        settings.sweeper.clone(),
    ));
    let worker = DispatchWorker::new(
        store,
        transport,
        consume_connections,
        settings.topology.clone(),
        settings.worker.clone(),
    );
    let worker_stats = worker.stats();

    let (shutdown_sender, _) = broadcast::channel(1);
    let worker_shutdown = shutdown_sender.subscribe();
    let worker_task = tokio::spawn(async move { worker.run(worker_shutdown).await });
    let sweeper_shutdown = shutdown_sender.subscribe();
    let sweeper_task = {
        let sweeper = Arc::clone(&sweeper);
        tokio::spawn(async move { sweeper.run(sweeper_shutdown).await })
    };

    info!(
        channel = P::CHANNEL,
        exchange = %settings.topology.exchange,
        queue = %settings.topology.queue,
        "Dispatch system started"
    );

    Ok(DispatchSystemHandle {
        service,
        sweeper,
        worker_stats,
        publish_connections,
        shutdown_sender: Some(shutdown_sender),
        worker_task: Some(worker_task),
        sweeper_task: Some(sweeper_task),
    })
}

/// Start a pipeline backed by PostgreSQL and RabbitMQ as configured
pub async fn bootstrap<P, T>(
    config: &DispatchConfig,
    transport: T,
) -> anyhow::Result<DispatchSystemHandle<P, PgRecordStore<P>>>
where
    P: DispatchPayload,
    T: Transport<P>,
{
    config.validate().context("invalid dispatch configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_seconds))
        .connect(&config.database.url)
        .await
        .context("failed to connect to PostgreSQL")?;
    if config.database.run_migrations {
        run_migrations(&pool)
            .await
            .context("failed to run database migrations")?;
    }

    let store = Arc::new(PgRecordStore::<P>::new(pool));
    let connector: Arc<dyn BrokerConnector> =
        Arc::new(RabbitMqConnector::new(config.rabbitmq_settings()));

    start(store, connector, transport, DispatchSettings::from_config(config))
        .await
        .context("failed to start dispatch system")
}
