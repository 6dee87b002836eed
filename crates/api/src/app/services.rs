//! Runtime wiring: stores, clients and background workers for each service.
//!
//! Stores and clients are held behind trait objects so one router serves
//! both the in-memory and the Postgres deployment.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use supplyline_events::InMemoryEventBus;
use supplyline_infra::dispatch_store::{DispatchStore, InMemoryDispatchStore, PostgresDispatchStore};
use supplyline_infra::outbox::{
    HttpLogisticsNotifier, LoggingNotifier, LogisticsNotifier, OutboxRelay, OutboxStore,
    RelayConfig,
};
use supplyline_infra::remote::{HttpStockClient, StockClient};
use supplyline_infra::services::stock::AlertBus;
use supplyline_infra::stock_store::{InMemoryStockStore, PostgresStockStore, StockStore};
use supplyline_infra::store::pg;
use supplyline_infra::workers::{AlertLogger, LockReconciler, WorkerHandle};
use supplyline_infra::{DispatchOrchestrator, DispatchServiceConfig, StockLedger, StockServiceConfig};

pub type SharedStockStore = Arc<dyn StockStore>;
pub type SharedDispatchStore = Arc<dyn DispatchStore>;
pub type SharedStockClient = Arc<dyn StockClient>;

pub type Ledger = StockLedger<SharedStockStore>;
pub type Orchestrator = DispatchOrchestrator<SharedDispatchStore, SharedStockClient>;

const PG_MAX_CONNECTIONS: u32 = 10;
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Stock service state plus its alert logger.
pub struct StockServices {
    pub ledger: Arc<Ledger>,
    workers: Vec<WorkerHandle>,
}

impl StockServices {
    pub async fn from_config(config: &StockServiceConfig) -> anyhow::Result<Self> {
        let store: SharedStockStore = match &config.database_url {
            Some(url) => {
                let pool = pg::connect(url, PG_MAX_CONNECTIONS)
                    .await
                    .context("connecting to the stock database")?;
                let store = PostgresStockStore::new(pool, config.row_lock_timeout);
                store
                    .ensure_schema()
                    .await
                    .context("applying the stock schema")?;
                Arc::new(store)
            }
            None => {
                tracing::warn!("STOCK_DATABASE_URL not set; using in-memory stores");
                Arc::new(InMemoryStockStore::new(config.row_lock_timeout))
            }
        };
        Ok(Self::with_store(store))
    }

    /// Must be called inside a tokio runtime.
    pub fn with_store(store: SharedStockStore) -> Self {
        let alerts: AlertBus = Arc::new(InMemoryEventBus::new());
        let alert_logger = AlertLogger::spawn(alerts.as_ref());
        Self {
            ledger: Arc::new(StockLedger::new(store, alerts)),
            workers: vec![alert_logger],
        }
    }

    pub async fn shutdown(self) {
        shutdown_all(self.workers).await;
    }
}

/// Dispatch service state plus the lock reconciler and the outbox relay.
pub struct DispatchServices {
    pub orchestrator: Arc<Orchestrator>,
    workers: Vec<WorkerHandle>,
}

impl DispatchServices {
    pub async fn from_config(config: &DispatchServiceConfig) -> anyhow::Result<Self> {
        let client: SharedStockClient = Arc::new(
            HttpStockClient::new(config.stock_service_url.clone(), config.lock_call_timeout)
                .context("building the stock service client")?,
        );
        let notifier: Arc<dyn LogisticsNotifier> = match &config.logistics_url {
            Some(url) => Arc::new(
                HttpLogisticsNotifier::new(url.clone(), NOTIFY_TIMEOUT)
                    .context("building the logistics notifier")?,
            ),
            None => {
                tracing::info!("LOGISTICS_URL not set; logistics notifications are logged only");
                Arc::new(LoggingNotifier)
            }
        };

        match &config.database_url {
            Some(url) => {
                let pool = pg::connect(url, PG_MAX_CONNECTIONS)
                    .await
                    .context("connecting to the dispatch database")?;
                let store = PostgresDispatchStore::new(pool, config.row_lock_timeout);
                store
                    .ensure_schema()
                    .await
                    .context("applying the dispatch schema")?;
                Ok(Self::with_parts(Arc::new(store), client, notifier, config))
            }
            None => {
                tracing::warn!("DISPATCH_DATABASE_URL not set; using in-memory stores");
                let store = Arc::new(InMemoryDispatchStore::new(config.row_lock_timeout));
                Ok(Self::with_parts(store, client, notifier, config))
            }
        }
    }

    /// Wire the orchestrator and start the workers. Must be called inside a
    /// tokio runtime.
    pub fn with_parts<S>(
        store: Arc<S>,
        client: SharedStockClient,
        notifier: Arc<dyn LogisticsNotifier>,
        config: &DispatchServiceConfig,
    ) -> Self
    where
        S: DispatchStore + OutboxStore + 'static,
    {
        let dispatch_store: SharedDispatchStore = store.clone();
        let outbox_store: Arc<dyn OutboxStore> = store;

        let reconciler = LockReconciler::new(
            dispatch_store.clone(),
            client.clone(),
            config.orphan_ttl,
            config.lock_call_timeout,
        )
        .spawn(config.reconcile_interval);
        let relay = OutboxRelay::new(outbox_store, notifier, RelayConfig::default())
            .spawn(config.outbox_poll_interval);

        Self {
            orchestrator: Arc::new(DispatchOrchestrator::new(
                dispatch_store,
                client,
                config.lock_call_timeout,
            )),
            workers: vec![reconciler, relay],
        }
    }

    pub async fn shutdown(self) {
        shutdown_all(self.workers).await;
    }
}

async fn shutdown_all(workers: Vec<WorkerHandle>) {
    for worker in workers {
        let name = worker.name();
        worker.shutdown().await;
        tracing::info!(worker = name, "worker stopped");
    }
}
