//! Periodic sweep that settles allocation attempts left in doubt.
//!
//! An attempt stuck in `Requested` or `Locked` for longer than the orphan
//! TTL is claimed as `LockOrphaned`, which stops it from ever becoming a
//! task, and its lock key is released on the stock side. Releasing a key
//! that never locked anything retires it, so a late lock call is refused.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::dispatch_store::DispatchStore;
use crate::remote::StockClient;
use crate::services::dispatch::{DispatchError, orphan_attempt, release_orphaned_lock};

use super::{WorkerHandle, shutdown_channel};

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Attempts looked at.
    pub examined: usize,
    /// Attempts moved to `LockOrphaned` by this sweep.
    pub orphaned: usize,
    /// Locks confirmed released.
    pub released: usize,
    /// Releases that failed and will be retried next sweep.
    pub failed: usize,
}

pub struct LockReconciler<S, C> {
    store: S,
    client: C,
    orphan_ttl: chrono::Duration,
    call_timeout: Duration,
}

impl<S, C> LockReconciler<S, C>
where
    S: DispatchStore,
    C: StockClient,
{
    pub fn new(store: S, client: C, orphan_ttl: Duration, call_timeout: Duration) -> Self {
        Self {
            store,
            client,
            orphan_ttl: chrono::Duration::from_std(orphan_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            call_timeout,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, DispatchError> {
        let candidates = self
            .store
            .attempts_needing_attention(now - self.orphan_ttl)
            .await?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for candidate in candidates {
            let attempt = if candidate.status.is_in_flight() {
                match orphan_attempt(&self.store, candidate.id).await {
                    Ok(Some(attempt)) => {
                        report.orphaned += 1;
                        attempt
                    }
                    // Finished or claimed elsewhere since it was listed.
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(attempt_id = %candidate.id, error = %err, "attempt not orphaned");
                        report.failed += 1;
                        continue;
                    }
                }
            } else if candidate.needs_release() {
                candidate
            } else {
                continue;
            };

            match release_orphaned_lock(&self.store, &self.client, &attempt, self.call_timeout).await
            {
                Ok(()) => report.released += 1,
                Err(err) => {
                    warn!(attempt_id = %attempt.id, error = %err, "lock release failed, retrying next sweep");
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(?report, "reconciler sweep finished");
        }
        Ok(report)
    }
}

impl<S, C> LockReconciler<S, C>
where
    S: DispatchStore + 'static,
    C: StockClient + 'static,
{
    /// Sweep every `interval` on a tokio task until shut down.
    pub fn spawn(self, interval: Duration) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
        let join = tokio::spawn(async move {
            info!(worker = "lock-reconciler", ?interval, "lock reconciler started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.sweep_once(Utc::now()).await {
                    Ok(report) => debug!(?report, "sweep"),
                    Err(err) => warn!(error = %err, "reconciler sweep failed"),
                }
            }
            info!(worker = "lock-reconciler", "lock reconciler stopped");
        });
        WorkerHandle::new("lock-reconciler", shutdown_tx, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use supplyline_core::{LockKey, MaterialId, RequestId};
    use supplyline_dispatch::{
        AllocationAttempt, AttemptStatus, AuditAction, NewDemandRequest, RequestStatus, Urgency,
    };
    use supplyline_stock::{
        InventoryItemView, LockItem, LockStatus, LockStockRequest, LockStockResponse, NewMaterial,
        ReleaseLockResponse,
    };

    use crate::dispatch_store::InMemoryDispatchStore;
    use crate::remote::{LocalStockClient, RemoteError};
    use crate::services::dispatch::DispatchOrchestrator;
    use crate::services::stock::{AlertBus, InboundCommand, StockLedger};
    use crate::stock_store::InMemoryStockStore;

    type Ledger = StockLedger<Arc<InMemoryStockStore>>;
    type Local = LocalStockClient<Arc<InMemoryStockStore>>;

    /// Takes the lock but reports a timeout, like a response lost in transit.
    struct LostResponse {
        inner: Local,
    }

    #[async_trait::async_trait]
    impl StockClient for LostResponse {
        async fn list_inventory_items(
            &self,
            material_id: MaterialId,
        ) -> Result<Vec<InventoryItemView>, RemoteError> {
            self.inner.list_inventory_items(material_id).await
        }

        async fn lock_stock(&self, req: &LockStockRequest) -> Result<LockStockResponse, RemoteError> {
            self.inner.lock_stock(req).await?;
            Err(RemoteError::Timeout)
        }

        async fn release_lock(&self, lock_key: LockKey) -> Result<ReleaseLockResponse, RemoteError> {
            self.inner.release_lock(lock_key).await
        }
    }

    /// Release calls fail until `healthy` is set.
    struct Flaky {
        inner: Local,
        healthy: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StockClient for Flaky {
        async fn list_inventory_items(
            &self,
            material_id: MaterialId,
        ) -> Result<Vec<InventoryItemView>, RemoteError> {
            self.inner.list_inventory_items(material_id).await
        }

        async fn lock_stock(&self, req: &LockStockRequest) -> Result<LockStockResponse, RemoteError> {
            self.inner.lock_stock(req).await
        }

        async fn release_lock(&self, lock_key: LockKey) -> Result<ReleaseLockResponse, RemoteError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(RemoteError::Transport("connection refused".to_string()));
            }
            self.inner.release_lock(lock_key).await
        }
    }

    async fn setup() -> (Arc<Ledger>, Arc<InMemoryDispatchStore>, supplyline_stock::InventoryUnit) {
        let ledger = Arc::new(StockLedger::new(
            Arc::new(InMemoryStockStore::new(Duration::from_millis(500))),
            AlertBus::default(),
        ));
        let material = ledger
            .register_material(NewMaterial {
                name: "Tents".to_string(),
                category: "shelter".to_string(),
                unit: "piece".to_string(),
                batch_label: None,
                expiry_date: None,
                alert_threshold: Some(0),
            })
            .await
            .unwrap();
        let unit = ledger
            .inbound(InboundCommand {
                material_id: material.id,
                location: "Depot-1".to_string(),
                quantity: 10,
                operator: "warehouse".to_string(),
                remark: String::new(),
                related_order: None,
            })
            .await
            .unwrap()
            .unit;
        let dispatch = Arc::new(InMemoryDispatchStore::new(Duration::from_millis(500)));
        (ledger, dispatch, unit)
    }

    async fn approved_request<C: StockClient>(
        orchestrator: &DispatchOrchestrator<Arc<InMemoryDispatchStore>, C>,
        material_id: MaterialId,
    ) -> RequestId {
        let request = orchestrator
            .create_demand_request(
                NewDemandRequest {
                    material_id,
                    quantity: 4,
                    urgency: Urgency::L1,
                    target_area: "Zone-B".to_string(),
                    description: String::new(),
                },
                "reporter",
            )
            .await
            .unwrap();
        orchestrator
            .audit_demand_request(request.id, AuditAction::Approve, "", "auditor")
            .await
            .unwrap();
        request.id
    }

    #[tokio::test]
    async fn stale_locked_attempt_is_released_and_never_committed() {
        let (ledger, dispatch, unit) = setup().await;
        let orchestrator = DispatchOrchestrator::new(
            dispatch.clone(),
            LostResponse {
                inner: LocalStockClient::new(ledger.clone()),
            },
            Duration::from_secs(1),
        );
        let request_id = approved_request(&orchestrator, unit.material_id).await;
        let items = vec![LockItem {
            inventory_unit_id: unit.id,
            quantity: 4,
        }];

        let err = orchestrator
            .create_dispatch_task(request_id, items, "dispatcher")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RemoteUnavailable(_)));
        assert_eq!(ledger.get_unit(unit.id).await.unwrap().locked_quantity, 4);

        let reconciler = LockReconciler::new(
            dispatch.clone(),
            LocalStockClient::new(ledger.clone()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let fresh = reconciler.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(fresh.orphaned, 0);

        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = reconciler.sweep_once(later).await.unwrap();
        assert_eq!((report.orphaned, report.released, report.failed), (1, 1, 0));
        assert_eq!(ledger.get_unit(unit.id).await.unwrap().locked_quantity, 0);

        let attempts = orchestrator.attempts_for_request(request_id).await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::LockOrphaned);
        assert!(attempts[0].lock_released_at.is_some());
        assert!(dispatch.task_for_request(request_id).await.unwrap().is_none());
        let request = orchestrator.get_demand_request(request_id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Approved);

        let again = reconciler.sweep_once(later).await.unwrap();
        assert_eq!(again.examined, 0);
    }

    #[tokio::test]
    async fn release_before_lock_retires_the_key() {
        let (ledger, dispatch, unit) = setup().await;
        let attempt = AllocationAttempt::begin(
            RequestId::new(),
            vec![LockItem {
                inventory_unit_id: unit.id,
                quantity: 3,
            }],
            Utc::now(),
        );
        let mut tx = dispatch.begin().await.unwrap();
        tx.insert_attempt(&attempt).await.unwrap();
        tx.commit().await.unwrap();

        let reconciler = LockReconciler::new(
            dispatch.clone(),
            LocalStockClient::new(ledger.clone()),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let report = reconciler
            .sweep_once(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(report.released, 1);

        let late = ledger
            .lock_stock(&LockStockRequest {
                request_id: attempt.request_id,
                lock_key: attempt.lock_key(),
                items: attempt.items.clone(),
            })
            .await;
        assert!(late.is_err());
        assert_eq!(ledger.get_unit(unit.id).await.unwrap().locked_quantity, 0);
        let lock = ledger.lock_status(attempt.lock_key()).await.unwrap().unwrap();
        assert_eq!(lock.status, LockStatus::Released);
    }

    #[tokio::test]
    async fn failed_release_is_retried_next_sweep() {
        let (ledger, dispatch, unit) = setup().await;
        let orchestrator = DispatchOrchestrator::new(
            dispatch.clone(),
            LostResponse {
                inner: LocalStockClient::new(ledger.clone()),
            },
            Duration::from_secs(1),
        );
        let request_id = approved_request(&orchestrator, unit.material_id).await;
        let _ = orchestrator
            .create_dispatch_task(
                request_id,
                vec![LockItem {
                    inventory_unit_id: unit.id,
                    quantity: 4,
                }],
                "dispatcher",
            )
            .await;

        let client = Arc::new(Flaky {
            inner: LocalStockClient::new(ledger.clone()),
            healthy: AtomicBool::new(false),
        });
        let reconciler = LockReconciler::new(
            dispatch.clone(),
            client.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let later = Utc::now() + chrono::Duration::seconds(5);

        let first = reconciler.sweep_once(later).await.unwrap();
        assert_eq!((first.orphaned, first.released, first.failed), (1, 0, 1));
        assert_eq!(ledger.get_unit(unit.id).await.unwrap().locked_quantity, 4);

        client.healthy.store(true, Ordering::SeqCst);
        let second = reconciler.sweep_once(later).await.unwrap();
        assert_eq!((second.orphaned, second.released), (0, 1));
        assert_eq!(ledger.get_unit(unit.id).await.unwrap().locked_quantity, 0);
    }

    #[tokio::test]
    async fn spawned_reconciler_shuts_down() {
        let (ledger, dispatch, _) = setup().await;
        let handle = LockReconciler::new(
            dispatch,
            LocalStockClient::new(ledger),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .spawn(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
    }
}
