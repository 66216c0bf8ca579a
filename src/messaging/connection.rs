//! # Connection Manager
//!
//! Owns the current broker handle and replaces it when it dies. Publisher and
//! worker share one manager through an `Arc`; nothing about the connection
//! lives in global state.
//!
//! Every fresh connection re-declares the registered topologies, so a broker
//! that lost its non-durable state (or a brand new broker) is usable
//! immediately after a reconnect.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::errors::{MessagingError, MessagingResult};
use super::topology::QueueTopology;
use super::traits::{BrokerConnector, MessageBroker};

/// Exponential reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts made by [`ConnectionManager::connect_on_startup`] before giving up
    pub max_startup_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_startup_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based): initial * 2^(attempt-1), capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    policy: ReconnectPolicy,
    topologies: Vec<QueueTopology>,
    current: Mutex<Option<Arc<dyn MessageBroker>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.connector.describe())
            .field("policy", &self.policy)
            .field("topologies", &self.topologies.len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            topologies: Vec::new(),
            current: Mutex::new(None),
        }
    }

    /// Register a topology to declare on every new connection
    pub fn with_topology(mut self, topology: QueueTopology) -> Self {
        self.topologies.push(topology);
        self
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Initial connect with bounded retries. Failure here is fatal to startup.
    pub async fn connect_on_startup(&self) -> MessagingResult<Arc<dyn MessageBroker>> {
        let max_attempts = self.policy.max_startup_attempts.max(1);
        let mut last_error = MessagingError::connection("no connection attempt made");

        for attempt in 1..=max_attempts {
            match self.reconnect().await {
                Ok(broker) => return Ok(broker),
                Err(e) => {
                    warn!(
                        target = %self.connector.describe(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    last_error = e;
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
            }
        }

        Err(last_error)
    }

    /// Current broker, reconnecting once if the held handle is unhealthy
    pub async fn broker(&self) -> MessagingResult<Arc<dyn MessageBroker>> {
        {
            let current = self.current.lock().await;
            if let Some(broker) = current.as_ref() {
                if matches!(broker.health_check().await, Ok(true)) {
                    return Ok(Arc::clone(broker));
                }
            }
        }
        self.reconnect().await
    }

    /// Reconnect until it succeeds, backing off exponentially between attempts.
    /// Callers cancel this by dropping the future (e.g. from `tokio::select!`).
    pub async fn reconnect_with_backoff(&self) -> Arc<dyn MessageBroker> {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            match self.reconnect().await {
                Ok(broker) => {
                    if attempt > 1 {
                        info!(attempt, "Broker connection restored");
                    }
                    return broker;
                }
                Err(e) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker reconnect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Open a fresh connection and declare registered topologies
    pub async fn reconnect(&self) -> MessagingResult<Arc<dyn MessageBroker>> {
        let mut current = self.current.lock().await;
        if let Some(stale) = current.take() {
            if let Err(e) = stale.close().await {
                debug!(error = %e, "Closing stale broker handle failed");
            }
        }

        let broker = self.connector.connect().await?;
        for topology in &self.topologies {
            broker.declare_topology(topology).await?;
        }

        info!(
            target = %self.connector.describe(),
            provider = broker.provider_name(),
            topologies = self.topologies.len(),
            "Broker connected"
        );
        *current = Some(Arc::clone(&broker));
        Ok(broker)
    }

    /// Drop the held handle so the next [`broker`](Self::broker) call reconnects
    pub async fn invalidate(&self) {
        self.current.lock().await.take();
    }

    pub async fn close(&self) -> MessagingResult<()> {
        if let Some(broker) = self.current.lock().await.take() {
            broker.close().await?;
        }
        Ok(())
    }
}
