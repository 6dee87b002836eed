//! Relay draining the outbox into a [`LogisticsNotifier`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::store::StoreError;
use crate::workers::{WorkerHandle, shutdown_channel};

use super::notifier::LogisticsNotifier;
use super::store::OutboxStore;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a claimed message stays hidden from other relays.
    pub lease: Duration,
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            batch_size: 32,
        }
    }
}

/// Outcome counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl RelayStats {
    pub fn attempted(&self) -> u64 {
        self.delivered + self.retried + self.dead_lettered
    }
}

pub struct OutboxRelay<S, N> {
    store: S,
    notifier: N,
    config: RelayConfig,
}

impl<S, N> OutboxRelay<S, N>
where
    S: OutboxStore,
    N: LogisticsNotifier,
{
    pub fn new(store: S, notifier: N, config: RelayConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Claim messages due at `now` and try each once. Retries are scheduled
    /// relative to `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RelayStats, StoreError> {
        let claimed = self
            .store
            .claim_due(now, self.config.lease, self.config.batch_size)
            .await?;
        let mut stats = RelayStats::default();

        for mut message in claimed {
            match self.notifier.notify(&message).await {
                Ok(()) => {
                    message.mark_delivered(now);
                    stats.delivered += 1;
                    debug!(outbox_id = %message.id, attempt = message.attempts, "outbox message delivered");
                }
                Err(err) => {
                    message.mark_failed(err.to_string(), now);
                    if message.status.is_terminal() {
                        stats.dead_lettered += 1;
                        error!(
                            outbox_id = %message.id,
                            attempts = message.attempts,
                            error = %err,
                            "outbox message dead-lettered"
                        );
                    } else {
                        stats.retried += 1;
                        warn!(
                            outbox_id = %message.id,
                            attempt = message.attempts,
                            retry_at = %message.scheduled_at,
                            error = %err,
                            "outbox delivery failed, retry scheduled"
                        );
                    }
                }
            }
            self.store.save_outcome(&message).await?;
        }

        Ok(stats)
    }
}

impl<S, N> OutboxRelay<S, N>
where
    S: OutboxStore + 'static,
    N: LogisticsNotifier + 'static,
{
    /// Run passes every `poll_interval` on a tokio task until shut down.
    pub fn spawn(self, poll_interval: Duration) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
        let join = tokio::spawn(async move {
            info!(worker = "outbox-relay", ?poll_interval, "outbox relay started");
            loop {
                match self.run_once(Utc::now()).await {
                    Ok(stats) if stats.attempted() > 0 => {
                        debug!(?stats, "outbox relay pass");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "outbox relay pass failed"),
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            info!(worker = "outbox-relay", "outbox relay stopped");
        });
        WorkerHandle::new("outbox-relay", shutdown_tx, join)
    }
}
