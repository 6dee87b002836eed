//! Dispatch orchestrator.
//!
//! Drives demand requests through audit and task creation. Task creation is
//! a saga across the two stores, which never share a unit of work:
//!
//! 1. record an [`AllocationAttempt`] (`Requested`) under the request lock,
//! 2. call `lockStock` with the attempt id as lock key,
//! 3. mark the attempt `Locked`,
//! 4. commit task, status change, log entry, attempt `Committed` and the
//!    logistics outbox message together.
//!
//! The remote lock always happens before the local commit. An in-doubt lock
//! call leaves the attempt in flight for the [`LockReconciler`] to release.
//!
//! [`LockReconciler`]: crate::workers::LockReconciler

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use supplyline_core::{AttemptId, DomainError, Page, Pagination, RequestId, TaskId};
use supplyline_dispatch::{
    AllocationAttempt, AllocationPlan, AttemptStatus, AuditAction, DemandRequest, DispatchLog,
    DispatchTask, LogAction, LogisticsUpdate, NewDemandRequest, PlanError, RequestStatus,
    Shortfall, plan_allocation,
};
use supplyline_stock::{LockItem, LockStockRequest, normalize_lines};

use crate::dispatch_store::{DispatchStore, DispatchTx};
use crate::outbox::TaskCreatedNotice;
use crate::remote::{RemoteError, StockClient};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("request {request_id} cannot be audited in status {status}")]
    InvalidStateForAudit {
        request_id: RequestId,
        status: RequestStatus,
    },

    #[error("request {request_id} is {status}, not approved")]
    RequestNotApproved {
        request_id: RequestId,
        status: RequestStatus,
    },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Shortfall(Shortfall),

    #[error("stock lock failed: {0}")]
    StockLockFailed(String),

    #[error("stock service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for DispatchError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(m) | DomainError::InvalidId(m) => DispatchError::Validation(m),
            DomainError::NotFound(m) => DispatchError::NotFound(m),
            DomainError::Conflict(m) | DomainError::InsufficientStock(m) => {
                DispatchError::Conflict(m)
            }
            DomainError::InvariantViolation(m) | DomainError::InvalidTransition(m) => {
                DispatchError::InvalidTransition(m)
            }
        }
    }
}

impl From<PlanError> for DispatchError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::InvalidQuantity(_) => DispatchError::Validation(err.to_string()),
            PlanError::Shortfall(shortfall) => DispatchError::Shortfall(shortfall),
        }
    }
}

const CREATE_REMARK: &str = "User reported demand";
const START_AUDIT_REMARK: &str = "Audit started";
const CREATE_TASK_REMARK: &str = "Dispatch task generated and stock locked";

pub struct DispatchOrchestrator<S, C> {
    store: S,
    client: C,
    /// Upper bound on every stock service call.
    lock_call_timeout: Duration,
}

impl<S, C> DispatchOrchestrator<S, C>
where
    S: DispatchStore,
    C: StockClient,
{
    pub fn new(store: S, client: C, lock_call_timeout: Duration) -> Self {
        Self {
            store,
            client,
            lock_call_timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    #[instrument(skip(self, new), fields(material_id = %new.material_id, quantity = new.quantity), err)]
    pub async fn create_demand_request(
        &self,
        new: NewDemandRequest,
        operator: &str,
    ) -> Result<DemandRequest, DispatchError> {
        let now = Utc::now();
        let (request, change) = new.into_request(now)?;

        let mut tx = self.store.begin().await?;
        tx.insert_request(&request).await?;
        tx.append_log(&DispatchLog::record(
            request.id,
            change,
            LogAction::Create,
            operator,
            CREATE_REMARK,
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(request_id = %request.id, "demand request created");
        Ok(request)
    }

    pub async fn get_demand_request(&self, id: RequestId) -> Result<DemandRequest, DispatchError> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| request_not_found(id))
    }

    pub async fn list_demand_requests(
        &self,
        status: Option<RequestStatus>,
        page: Pagination,
    ) -> Result<Page<DemandRequest>, DispatchError> {
        Ok(self.store.list_requests(status, page).await?)
    }

    /// Pending -> Auditing.
    #[instrument(skip(self), fields(request_id = %id), err)]
    pub async fn start_audit(
        &self,
        id: RequestId,
        operator: &str,
    ) -> Result<DemandRequest, DispatchError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut request = load_live_request(tx.as_mut(), id).await?;
        if request.status != RequestStatus::Pending {
            return Err(DispatchError::InvalidStateForAudit {
                request_id: id,
                status: request.status,
            });
        }

        let change = request.start_audit(now)?;
        tx.update_request(&request).await?;
        tx.append_log(&DispatchLog::record(
            id,
            change,
            LogAction::StartAudit,
            operator,
            START_AUDIT_REMARK,
            now,
        ))
        .await?;
        tx.commit().await?;

        info!("audit started");
        Ok(request)
    }

    /// Approve or reject. Reload, guard, status change and log entry commit
    /// together or not at all.
    #[instrument(skip(self, remark), fields(request_id = %id), err)]
    pub async fn audit_demand_request(
        &self,
        id: RequestId,
        action: AuditAction,
        remark: &str,
        operator: &str,
    ) -> Result<DemandRequest, DispatchError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut request = load_live_request(tx.as_mut(), id).await?;
        if !request.status.accepts_audit() {
            return Err(DispatchError::InvalidStateForAudit {
                request_id: id,
                status: request.status,
            });
        }

        let change = request.audit(action, remark, now)?;
        tx.update_request(&request).await?;
        tx.append_log(&DispatchLog::record(
            id,
            change,
            LogAction::Audit,
            operator,
            remark,
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(status = %request.status, "request audited");
        Ok(request)
    }

    /// FEFO plan for the request against the stock service's current view.
    #[instrument(skip(self), fields(request_id = %id), err)]
    pub async fn suggest_allocation(&self, id: RequestId) -> Result<AllocationPlan, DispatchError> {
        let request = self.get_demand_request(id).await?;
        let units = match tokio::time::timeout(
            self.lock_call_timeout,
            self.client.list_inventory_items(request.material_id),
        )
        .await
        {
            Ok(Ok(units)) => units,
            Ok(Err(err)) => return Err(DispatchError::RemoteUnavailable(err.to_string())),
            Err(_) => {
                return Err(DispatchError::RemoteUnavailable(format!(
                    "inventory listing timed out after {:?}",
                    self.lock_call_timeout
                )));
            }
        };
        debug!(units = units.len(), "inventory listed");
        Ok(plan_allocation(request.quantity, &units)?)
    }

    /// Lock stock for `allocations` and turn the approved request into a
    /// dispatch task.
    #[instrument(skip(self, allocations), fields(request_id = %id, lines = allocations.len()), err)]
    pub async fn create_dispatch_task(
        &self,
        id: RequestId,
        allocations: Vec<LockItem>,
        operator: &str,
    ) -> Result<DispatchTask, DispatchError> {
        normalize_lines(&allocations)?;

        let attempt = self.record_attempt(id, allocations.clone()).await?;
        let lock_key = attempt.lock_key();
        debug!(attempt_id = %attempt.id, "allocation attempt recorded");

        let req = LockStockRequest {
            request_id: id,
            lock_key,
            items: allocations,
        };
        match tokio::time::timeout(self.lock_call_timeout, self.client.lock_stock(&req)).await {
            Ok(Ok(response)) if response.success => {}
            Ok(Ok(response)) => {
                self.discard_attempt(attempt.id).await;
                return Err(DispatchError::StockLockFailed(response.message));
            }
            Ok(Err(RemoteError::Status { status, message })) if status < 500 => {
                self.discard_attempt(attempt.id).await;
                return Err(DispatchError::StockLockFailed(format!(
                    "stock service rejected the lock ({status}): {message}"
                )));
            }
            Ok(Err(err)) => {
                warn!(attempt_id = %attempt.id, error = %err, "lock call outcome unknown");
                return Err(DispatchError::RemoteUnavailable(err.to_string()));
            }
            Err(_) => {
                warn!(attempt_id = %attempt.id, timeout = ?self.lock_call_timeout, "lock call timed out");
                return Err(DispatchError::RemoteUnavailable(format!(
                    "lock call timed out after {:?}",
                    self.lock_call_timeout
                )));
            }
        }

        let committed = match self.mark_attempt_locked(attempt.id).await {
            Ok(()) => self.commit_task(id, attempt.id, operator).await,
            Err(err) => Err(err),
        };
        match committed {
            Ok(task) => {
                info!(task_id = %task.id, "dispatch task created");
                Ok(task)
            }
            // The reconciler orphaned the attempt first and owns the release.
            Err(err @ DispatchError::StockLockFailed(_)) => Err(err),
            Err(err) => {
                warn!(attempt_id = %attempt.id, error = %err, "task commit failed, releasing stock lock");
                self.compensate(attempt.id).await;
                Err(err)
            }
        }
    }

    /// Feed a logistics progress report into the task and the request.
    #[instrument(skip(self), fields(request_id = %id), err)]
    pub async fn apply_logistics_update(
        &self,
        id: RequestId,
        update: LogisticsUpdate,
        operator: &str,
    ) -> Result<DispatchTask, DispatchError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut request = load_live_request(tx.as_mut(), id).await?;
        let mut task = tx
            .task_for_request_for_update(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("dispatch task for request {id}")))?;

        task.apply(&update, now)?;
        let (change, action, remark) = match &update {
            LogisticsUpdate::Shipped { logistics_ref } => (
                request.mark_shipping(now)?,
                LogAction::Ship,
                match logistics_ref {
                    Some(r) => format!("Shipped, logistics ref {r}"),
                    None => "Shipped".to_string(),
                },
            ),
            LogisticsUpdate::Delivered => (
                request.mark_signed(now)?,
                LogAction::Sign,
                "Delivered and signed for".to_string(),
            ),
        };
        tx.update_task(&task).await?;
        tx.update_request(&request).await?;
        tx.append_log(&DispatchLog::record(id, change, action, operator, remark, now))
            .await?;
        tx.commit().await?;

        info!(status = %request.status, "logistics update applied");
        Ok(task)
    }

    /// Soft delete. Only requests without committed stock can be removed.
    #[instrument(skip(self), fields(request_id = %id), err)]
    pub async fn remove_demand_request(
        &self,
        id: RequestId,
        operator: &str,
    ) -> Result<DemandRequest, DispatchError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut request = tx
            .request_for_update(id)
            .await?
            .ok_or_else(|| request_not_found(id))?;
        let change = request.remove(now)?;
        tx.update_request(&request).await?;
        tx.append_log(&DispatchLog::record(
            id,
            change,
            LogAction::Remove,
            operator,
            "Request withdrawn",
            now,
        ))
        .await?;
        tx.commit().await?;

        info!("demand request removed");
        Ok(request)
    }

    pub async fn list_dispatch_tasks(
        &self,
        page: Pagination,
    ) -> Result<Page<DispatchTask>, DispatchError> {
        Ok(self.store.list_tasks(page).await?)
    }

    pub async fn get_dispatch_task(&self, id: TaskId) -> Result<DispatchTask, DispatchError> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("dispatch task {id}")))
    }

    /// Dispatch log of a live request, oldest first.
    pub async fn request_history(&self, id: RequestId) -> Result<Vec<DispatchLog>, DispatchError> {
        self.get_demand_request(id).await?;
        Ok(self.store.request_history(id).await?)
    }

    pub async fn attempts_for_request(
        &self,
        id: RequestId,
    ) -> Result<Vec<AllocationAttempt>, DispatchError> {
        Ok(self.store.attempts_for_request(id).await?)
    }

    async fn record_attempt(
        &self,
        id: RequestId,
        items: Vec<LockItem>,
    ) -> Result<AllocationAttempt, DispatchError> {
        let mut tx = self.store.begin().await?;
        let request = load_live_request(tx.as_mut(), id).await?;
        ensure_approved(&request)?;
        if let Some(existing) = tx.in_flight_attempt(id).await? {
            return Err(DispatchError::Conflict(format!(
                "request {id} already has allocation attempt {} in flight",
                existing.id
            )));
        }
        let attempt = AllocationAttempt::begin(id, items, Utc::now());
        tx.insert_attempt(&attempt).await?;
        tx.commit().await?;
        Ok(attempt)
    }

    async fn mark_attempt_locked(&self, attempt_id: AttemptId) -> Result<(), DispatchError> {
        let mut tx = self.store.begin().await?;
        let mut attempt = load_attempt(tx.as_mut(), attempt_id).await?;
        attempt.mark_locked(Utc::now())?;
        tx.update_attempt(&attempt).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_task(
        &self,
        id: RequestId,
        attempt_id: AttemptId,
        operator: &str,
    ) -> Result<DispatchTask, DispatchError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut request = load_live_request(tx.as_mut(), id).await?;
        let mut attempt = load_attempt(tx.as_mut(), attempt_id).await?;
        ensure_approved(&request)?;

        let task = DispatchTask::create(id, operator, now);
        tx.insert_task(&task).await?;
        let change = request.begin_dispatch(now)?;
        tx.update_request(&request).await?;
        tx.append_log(&DispatchLog::record(
            id,
            change,
            LogAction::CreateTask,
            operator,
            CREATE_TASK_REMARK,
            now,
        ))
        .await?;
        attempt.mark_committed(now)?;
        tx.update_attempt(&attempt).await?;

        let message = TaskCreatedNotice::new(&task, &request, &attempt)
            .to_message(now)
            .map_err(|e| StoreError::Backend(format!("encode logistics notice: {e}")))?;
        tx.enqueue_outbox(&message).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Drop an attempt whose lock was refused. Nothing is held under its key;
    /// if the delete fails the reconciler retires the key later.
    async fn discard_attempt(&self, attempt_id: AttemptId) {
        let result: Result<(), StoreError> = async {
            let mut tx = self.store.begin().await?;
            if let Some(attempt) = tx.attempt_for_update(attempt_id).await? {
                if attempt.status == AttemptStatus::Requested {
                    tx.delete_attempt(attempt_id).await?;
                }
            }
            tx.commit().await
        }
        .await;
        if let Err(err) = result {
            warn!(attempt_id = %attempt_id, error = %err, "refused attempt not discarded");
        }
    }

    /// Orphan the attempt and release its lock right away. Anything that
    /// fails here is picked up by the next reconciler sweep.
    async fn compensate(&self, attempt_id: AttemptId) {
        match orphan_attempt(&self.store, attempt_id).await {
            Ok(Some(attempt)) => {
                if let Err(err) =
                    release_orphaned_lock(&self.store, &self.client, &attempt, self.lock_call_timeout)
                        .await
                {
                    warn!(attempt_id = %attempt_id, error = %err, "compensating release failed");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(attempt_id = %attempt_id, error = %err, "attempt not orphaned"),
        }
    }
}

/// Claim an in-flight attempt as `LockOrphaned`. `None` when it is gone or
/// no longer in flight.
pub(crate) async fn orphan_attempt<S: DispatchStore>(
    store: &S,
    attempt_id: AttemptId,
) -> Result<Option<AllocationAttempt>, DispatchError> {
    let mut tx = store.begin().await?;
    let Some(mut attempt) = tx.attempt_for_update(attempt_id).await? else {
        return Ok(None);
    };
    if !attempt.status.is_in_flight() {
        return Ok(None);
    }
    attempt.mark_orphaned(Utc::now())?;
    tx.update_attempt(&attempt).await?;
    tx.commit().await?;
    info!(attempt_id = %attempt_id, request_id = %attempt.request_id, "allocation attempt orphaned");
    Ok(Some(attempt))
}

/// Release the stock lock of an orphaned attempt and record the release.
pub(crate) async fn release_orphaned_lock<S: DispatchStore, C: StockClient>(
    store: &S,
    client: &C,
    attempt: &AllocationAttempt,
    call_timeout: Duration,
) -> Result<(), DispatchError> {
    let response = match tokio::time::timeout(call_timeout, client.release_lock(attempt.lock_key()))
        .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => return Err(DispatchError::RemoteUnavailable(err.to_string())),
        Err(_) => {
            return Err(DispatchError::RemoteUnavailable(format!(
                "release call timed out after {call_timeout:?}"
            )));
        }
    };
    if !response.released {
        return Err(DispatchError::StockLockFailed(response.message));
    }

    // The attempt is orphaned here; `load_attempt` would refuse it.
    let mut tx = store.begin().await?;
    let mut current = tx.attempt_for_update(attempt.id).await?.ok_or_else(|| {
        DispatchError::Conflict(format!("allocation attempt {} disappeared", attempt.id))
    })?;
    if current.lock_released_at.is_none() {
        current.mark_lock_released(Utc::now())?;
        tx.update_attempt(&current).await?;
    }
    tx.commit().await?;
    info!(attempt_id = %attempt.id, message = %response.message, "orphaned lock released");
    Ok(())
}

async fn load_live_request(
    tx: &mut dyn DispatchTx,
    id: RequestId,
) -> Result<DemandRequest, DispatchError> {
    match tx.request_for_update(id).await? {
        Some(request) if !request.is_removed() => Ok(request),
        _ => Err(request_not_found(id)),
    }
}

/// Reload an attempt under lock; an attempt the reconciler already orphaned
/// can no longer become a task.
async fn load_attempt(
    tx: &mut dyn DispatchTx,
    id: AttemptId,
) -> Result<AllocationAttempt, DispatchError> {
    let attempt = tx
        .attempt_for_update(id)
        .await?
        .ok_or_else(|| DispatchError::Conflict(format!("allocation attempt {id} disappeared")))?;
    if attempt.status == AttemptStatus::LockOrphaned {
        return Err(DispatchError::StockLockFailed(format!(
            "allocation attempt {id} was orphaned before the task was committed; its lock is being released"
        )));
    }
    Ok(attempt)
}

fn ensure_approved(request: &DemandRequest) -> Result<(), DispatchError> {
    if request.status != RequestStatus::Approved {
        return Err(DispatchError::RequestNotApproved {
            request_id: request.id,
            status: request.status,
        });
    }
    Ok(())
}

fn request_not_found(id: RequestId) -> DispatchError {
    DispatchError::NotFound(format!("demand request {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use supplyline_core::{LockKey, MaterialId};
    use supplyline_dispatch::{TaskStatus, Urgency};
    use supplyline_stock::{
        InventoryItemView, LockStockResponse, NewMaterial, ReleaseLockResponse,
    };

    use crate::dispatch_store::InMemoryDispatchStore;
    use chrono::DateTime;

    use crate::outbox::{OutboxMessage, OutboxStatus, OutboxStore};
    use crate::remote::LocalStockClient;
    use crate::services::stock::{AlertBus, InboundCommand, StockLedger};
    use crate::stock_store::InMemoryStockStore;

    type Ledger = StockLedger<Arc<InMemoryStockStore>>;
    type Local = LocalStockClient<Arc<InMemoryStockStore>>;

    struct Fixture {
        ledger: Arc<Ledger>,
        dispatch: Arc<InMemoryDispatchStore>,
        orchestrator: DispatchOrchestrator<Arc<InMemoryDispatchStore>, Local>,
        material_id: MaterialId,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(StockLedger::new(
            Arc::new(InMemoryStockStore::new(Duration::from_millis(500))),
            AlertBus::default(),
        ));
        let material = ledger
            .register_material(NewMaterial {
                name: "Bottled water".to_string(),
                category: "water".to_string(),
                unit: "crate".to_string(),
                batch_label: Some("W-1".to_string()),
                expiry_date: None,
                alert_threshold: Some(0),
            })
            .await
            .unwrap();
        let dispatch = Arc::new(InMemoryDispatchStore::new(Duration::from_millis(500)));
        let orchestrator = DispatchOrchestrator::new(
            dispatch.clone(),
            LocalStockClient::new(ledger.clone()),
            Duration::from_secs(2),
        );
        Fixture {
            ledger,
            dispatch,
            orchestrator,
            material_id: material.id,
        }
    }

    impl Fixture {
        async fn stock(&self, location: &str, qty: i64) -> supplyline_stock::InventoryUnit {
            self.ledger
                .inbound(InboundCommand {
                    material_id: self.material_id,
                    location: location.to_string(),
                    quantity: qty,
                    operator: "warehouse".to_string(),
                    remark: String::new(),
                    related_order: None,
                })
                .await
                .unwrap()
                .unit
        }

        async fn request(&self, qty: i64) -> DemandRequest {
            self.orchestrator
                .create_demand_request(
                    NewDemandRequest {
                        material_id: self.material_id,
                        quantity: qty,
                        urgency: Urgency::L1,
                        target_area: "Zone-A".to_string(),
                        description: String::new(),
                    },
                    "reporter",
                )
                .await
                .unwrap()
        }

        async fn approved(&self, qty: i64) -> DemandRequest {
            let request = self.request(qty).await;
            self.orchestrator
                .audit_demand_request(request.id, AuditAction::Approve, "ok", "auditor")
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn end_to_end_dispatch() {
        let fx = fixture().await;
        let u1 = fx.stock("Depot-A", 5).await;
        let u2 = fx.stock("Depot-B", 10).await;
        let request = fx.approved(8).await;

        let plan = fx.orchestrator.suggest_allocation(request.id).await.unwrap();
        let planned: Vec<_> = plan
            .lines
            .iter()
            .map(|l| (l.inventory_unit_id, l.quantity))
            .collect();
        assert_eq!(planned, vec![(u1.id, 5), (u2.id, 3)]);

        let task = fx
            .orchestrator
            .create_dispatch_task(request.id, plan.lock_items(), "dispatcher")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Created);

        assert_eq!(fx.ledger.get_unit(u1.id).await.unwrap().locked_quantity, 5);
        assert_eq!(fx.ledger.get_unit(u2.id).await.unwrap().locked_quantity, 3);

        let request = fx.orchestrator.get_demand_request(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Dispatching);

        let history = fx.orchestrator.request_history(request.id).await.unwrap();
        let actions: Vec<_> = history.iter().map(|l| l.action).collect();
        assert_eq!(
            actions,
            vec![LogAction::Create, LogAction::Audit, LogAction::CreateTask]
        );
        assert!(DispatchLog::is_contiguous(&history));

        let attempts = fx.orchestrator.attempts_for_request(request.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Committed);

        let outbox = fx
            .dispatch
            .outbox_messages(Some(OutboxStatus::Pending), Pagination::default())
            .await
            .unwrap();
        assert_eq!(outbox.total, 1);
        assert_eq!(outbox.items[0].topic, TaskCreatedNotice::TOPIC);
        assert_eq!(outbox.items[0].payload["task_id"], task.id.to_string());
    }

    #[tokio::test]
    async fn audit_is_refused_once_decided() {
        let fx = fixture().await;
        let request = fx.request(3).await;
        fx.orchestrator
            .audit_demand_request(request.id, AuditAction::Reject, "duplicate", "auditor")
            .await
            .unwrap();

        let err = fx
            .orchestrator
            .audit_demand_request(request.id, AuditAction::Approve, "retry", "auditor")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidStateForAudit {
                status: RequestStatus::Rejected,
                ..
            }
        ));

        let request = fx.orchestrator.get_demand_request(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Rejected);
        assert_eq!(request.audit_remark, "duplicate");
        assert_eq!(fx.orchestrator.request_history(request.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn start_audit_then_approve() {
        let fx = fixture().await;
        let request = fx.request(3).await;
        let request = fx.orchestrator.start_audit(request.id, "auditor").await.unwrap();
        assert_eq!(request.status, RequestStatus::Auditing);
        let err = fx
            .orchestrator
            .start_audit(request.id, "auditor")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidStateForAudit { .. }));

        let request = fx
            .orchestrator
            .audit_demand_request(request.id, AuditAction::Approve, "", "auditor")
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn task_requires_approval() {
        let fx = fixture().await;
        let unit = fx.stock("Depot-A", 5).await;
        let request = fx.request(2).await;

        let err = fx
            .orchestrator
            .create_dispatch_task(
                request.id,
                vec![LockItem {
                    inventory_unit_id: unit.id,
                    quantity: 2,
                }],
                "dispatcher",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::RequestNotApproved {
                status: RequestStatus::Pending,
                ..
            }
        ));
        assert_eq!(fx.ledger.get_unit(unit.id).await.unwrap().locked_quantity, 0);
    }

    #[tokio::test]
    async fn refused_lock_leaves_no_trace() {
        let fx = fixture().await;
        let unit = fx.stock("Depot-A", 5).await;
        let request = fx.approved(8).await;

        let err = fx
            .orchestrator
            .create_dispatch_task(
                request.id,
                vec![LockItem {
                    inventory_unit_id: unit.id,
                    quantity: 8,
                }],
                "dispatcher",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::StockLockFailed(_)));

        let request = fx.orchestrator.get_demand_request(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
        assert!(fx.dispatch.task_for_request(request.id).await.unwrap().is_none());
        assert!(fx.orchestrator.attempts_for_request(request.id).await.unwrap().is_empty());
        assert_eq!(fx.orchestrator.request_history(request.id).await.unwrap().len(), 2);
        assert_eq!(fx.ledger.get_unit(unit.id).await.unwrap().locked_quantity, 0);
    }

    #[tokio::test]
    async fn shortfall_reports_partial_plan() {
        let fx = fixture().await;
        fx.stock("Depot-A", 10).await;
        fx.stock("Depot-B", 5).await;
        let request = fx.approved(20).await;

        match fx.orchestrator.suggest_allocation(request.id).await {
            Err(DispatchError::Shortfall(shortfall)) => {
                assert_eq!(shortfall.missing, 5);
                assert_eq!(shortfall.partial.total(), 15);
            }
            other => panic!("expected shortfall, got {other:?}"),
        }
    }

    /// Checks that no task exists yet whenever a lock call arrives.
    struct OrderingProbe {
        inner: Local,
        dispatch: Arc<InMemoryDispatchStore>,
        observed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StockClient for OrderingProbe {
        async fn list_inventory_items(
            &self,
            material_id: MaterialId,
        ) -> Result<Vec<InventoryItemView>, RemoteError> {
            self.inner.list_inventory_items(material_id).await
        }

        async fn lock_stock(&self, req: &LockStockRequest) -> Result<LockStockResponse, RemoteError> {
            let task = self.dispatch.task_for_request(req.request_id).await.unwrap();
            assert!(task.is_none(), "task committed before stock was locked");
            let request = self.dispatch.get_request(req.request_id).await.unwrap().unwrap();
            assert_eq!(request.status, RequestStatus::Approved);
            self.observed.store(true, Ordering::SeqCst);
            self.inner.lock_stock(req).await
        }

        async fn release_lock(&self, lock_key: LockKey) -> Result<ReleaseLockResponse, RemoteError> {
            self.inner.release_lock(lock_key).await
        }
    }

    #[tokio::test]
    async fn lock_happens_before_local_commit() {
        let fx = fixture().await;
        let unit = fx.stock("Depot-A", 5).await;
        let request = fx.approved(2).await;
        let probe = Arc::new(OrderingProbe {
            inner: LocalStockClient::new(fx.ledger.clone()),
            dispatch: fx.dispatch.clone(),
            observed: AtomicBool::new(false),
        });
        let orchestrator =
            DispatchOrchestrator::new(fx.dispatch.clone(), probe.clone(), Duration::from_secs(2));

        orchestrator
            .create_dispatch_task(
                request.id,
                vec![LockItem {
                    inventory_unit_id: unit.id,
                    quantity: 2,
                }],
                "dispatcher",
            )
            .await
            .unwrap();
        assert!(probe.observed.load(Ordering::SeqCst));
    }

    /// Never answers a lock call.
    struct StalledStock;

    #[async_trait::async_trait]
    impl StockClient for StalledStock {
        async fn list_inventory_items(
            &self,
            _material_id: MaterialId,
        ) -> Result<Vec<InventoryItemView>, RemoteError> {
            Ok(Vec::new())
        }

        async fn lock_stock(&self, _req: &LockStockRequest) -> Result<LockStockResponse, RemoteError> {
            std::future::pending().await
        }

        async fn release_lock(&self, _lock_key: LockKey) -> Result<ReleaseLockResponse, RemoteError> {
            Err(RemoteError::Timeout)
        }
    }

    #[tokio::test]
    async fn timed_out_lock_keeps_attempt_in_flight() {
        let fx = fixture().await;
        let request = fx.approved(2).await;
        let orchestrator =
            DispatchOrchestrator::new(fx.dispatch.clone(), StalledStock, Duration::from_millis(50));
        let items = vec![LockItem {
            inventory_unit_id: supplyline_core::InventoryUnitId::new(),
            quantity: 2,
        }];

        let err = orchestrator
            .create_dispatch_task(request.id, items.clone(), "dispatcher")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RemoteUnavailable(_)));

        let attempts = orchestrator.attempts_for_request(request.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Requested);
        let request = orchestrator.get_demand_request(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Approved);

        let err = orchestrator
            .create_dispatch_task(request.id, items, "dispatcher")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Conflict(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_task_creation_locks_once() {
        let fx = Arc::new(fixture().await);
        let unit = fx.stock("Depot-A", 10).await;
        let request = fx.approved(4).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let fx = fx.clone();
            handles.push(tokio::spawn(async move {
                fx.orchestrator
                    .create_dispatch_task(
                        request.id,
                        vec![LockItem {
                            inventory_unit_id: unit.id,
                            quantity: 4,
                        }],
                        "dispatcher",
                    )
                    .await
            }));
        }
        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(err) => assert!(
                    matches!(
                        err,
                        DispatchError::Conflict(_) | DispatchError::RequestNotApproved { .. }
                    ),
                    "{err}"
                ),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(fx.ledger.get_unit(unit.id).await.unwrap().locked_quantity, 4);
    }

    #[tokio::test]
    async fn logistics_updates_drive_request_to_signed() {
        let fx = fixture().await;
        let unit = fx.stock("Depot-A", 5).await;
        let request = fx.approved(2).await;
        fx.orchestrator
            .create_dispatch_task(
                request.id,
                vec![LockItem {
                    inventory_unit_id: unit.id,
                    quantity: 2,
                }],
                "dispatcher",
            )
            .await
            .unwrap();

        let err = fx
            .orchestrator
            .apply_logistics_update(request.id, LogisticsUpdate::Delivered, "carrier")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition(_)));

        let task = fx
            .orchestrator
            .apply_logistics_update(
                request.id,
                LogisticsUpdate::Shipped {
                    logistics_ref: Some("TRK-1".to_string()),
                },
                "carrier",
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::InTransit);
        let task = fx
            .orchestrator
            .apply_logistics_update(request.id, LogisticsUpdate::Delivered, "carrier")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Delivered);
        assert_eq!(task.logistics_ref.as_deref(), Some("TRK-1"));

        let request = fx.orchestrator.get_demand_request(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Signed);
        let history = fx.orchestrator.request_history(request.id).await.unwrap();
        assert!(DispatchLog::is_contiguous(&history));
        assert_eq!(history.last().map(|l| l.action), Some(LogAction::Sign));
    }

    #[tokio::test]
    async fn removal_hides_request() {
        let fx = fixture().await;
        let request = fx.request(1).await;
        fx.orchestrator
            .remove_demand_request(request.id, "reporter")
            .await
            .unwrap();

        assert!(matches!(
            fx.orchestrator.get_demand_request(request.id).await,
            Err(DispatchError::NotFound(_))
        ));
        assert!(matches!(
            fx.orchestrator.remove_demand_request(request.id, "reporter").await,
            Err(DispatchError::NotFound(_))
        ));

        let approved = fx.approved(1).await;
        assert!(matches!(
            fx.orchestrator.remove_demand_request(approved.id, "reporter").await,
            Err(DispatchError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let fx = fixture().await;
        let err = fx
            .orchestrator
            .create_demand_request(
                NewDemandRequest {
                    material_id: fx.material_id,
                    quantity: 0,
                    urgency: Urgency::L3,
                    target_area: "Zone-A".to_string(),
                    description: String::new(),
                },
                "reporter",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    /// Dispatch store whose transactions refuse to enqueue outbox messages,
    /// so every task commit fails after the stock lock succeeded.
    struct OutboxDown {
        inner: Arc<InMemoryDispatchStore>,
    }

    struct OutboxDownTx {
        inner: Box<dyn DispatchTx>,
    }

    #[async_trait::async_trait]
    impl DispatchTx for OutboxDownTx {
        async fn request_for_update(
            &mut self,
            id: RequestId,
        ) -> Result<Option<DemandRequest>, StoreError> {
            self.inner.request_for_update(id).await
        }

        async fn insert_request(&mut self, request: &DemandRequest) -> Result<(), StoreError> {
            self.inner.insert_request(request).await
        }

        async fn update_request(&mut self, request: &DemandRequest) -> Result<(), StoreError> {
            self.inner.update_request(request).await
        }

        async fn append_log(&mut self, log: &DispatchLog) -> Result<(), StoreError> {
            self.inner.append_log(log).await
        }

        async fn insert_task(&mut self, task: &DispatchTask) -> Result<(), StoreError> {
            self.inner.insert_task(task).await
        }

        async fn task_for_request_for_update(
            &mut self,
            request_id: RequestId,
        ) -> Result<Option<DispatchTask>, StoreError> {
            self.inner.task_for_request_for_update(request_id).await
        }

        async fn update_task(&mut self, task: &DispatchTask) -> Result<(), StoreError> {
            self.inner.update_task(task).await
        }

        async fn attempt_for_update(
            &mut self,
            id: AttemptId,
        ) -> Result<Option<AllocationAttempt>, StoreError> {
            self.inner.attempt_for_update(id).await
        }

        async fn in_flight_attempt(
            &mut self,
            request_id: RequestId,
        ) -> Result<Option<AllocationAttempt>, StoreError> {
            self.inner.in_flight_attempt(request_id).await
        }

        async fn insert_attempt(&mut self, attempt: &AllocationAttempt) -> Result<(), StoreError> {
            self.inner.insert_attempt(attempt).await
        }

        async fn update_attempt(&mut self, attempt: &AllocationAttempt) -> Result<(), StoreError> {
            self.inner.update_attempt(attempt).await
        }

        async fn delete_attempt(&mut self, id: AttemptId) -> Result<(), StoreError> {
            self.inner.delete_attempt(id).await
        }

        async fn enqueue_outbox(&mut self, _message: &OutboxMessage) -> Result<(), StoreError> {
            Err(StoreError::Backend("outbox table unavailable".to_string()))
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.commit().await
        }
    }

    #[async_trait::async_trait]
    impl DispatchStore for OutboxDown {
        async fn begin(&self) -> Result<Box<dyn DispatchTx>, StoreError> {
            Ok(Box::new(OutboxDownTx {
                inner: self.inner.begin().await?,
            }))
        }

        async fn get_request(&self, id: RequestId) -> Result<Option<DemandRequest>, StoreError> {
            self.inner.get_request(id).await
        }

        async fn list_requests(
            &self,
            status: Option<RequestStatus>,
            page: Pagination,
        ) -> Result<Page<DemandRequest>, StoreError> {
            self.inner.list_requests(status, page).await
        }

        async fn get_task(&self, id: TaskId) -> Result<Option<DispatchTask>, StoreError> {
            self.inner.get_task(id).await
        }

        async fn task_for_request(
            &self,
            request_id: RequestId,
        ) -> Result<Option<DispatchTask>, StoreError> {
            self.inner.task_for_request(request_id).await
        }

        async fn list_tasks(&self, page: Pagination) -> Result<Page<DispatchTask>, StoreError> {
            self.inner.list_tasks(page).await
        }

        async fn request_history(
            &self,
            request_id: RequestId,
        ) -> Result<Vec<DispatchLog>, StoreError> {
            self.inner.request_history(request_id).await
        }

        async fn get_attempt(&self, id: AttemptId) -> Result<Option<AllocationAttempt>, StoreError> {
            self.inner.get_attempt(id).await
        }

        async fn attempts_for_request(
            &self,
            request_id: RequestId,
        ) -> Result<Vec<AllocationAttempt>, StoreError> {
            self.inner.attempts_for_request(request_id).await
        }

        async fn attempts_needing_attention(
            &self,
            stale_before: DateTime<Utc>,
        ) -> Result<Vec<AllocationAttempt>, StoreError> {
            self.inner.attempts_needing_attention(stale_before).await
        }
    }

    #[tokio::test]
    async fn failed_commit_releases_the_lock() {
        let fx = fixture().await;
        let unit = fx.stock("Depot-A", 6).await;
        let request = fx.approved(4).await;

        let orchestrator = DispatchOrchestrator::new(
            OutboxDown {
                inner: fx.dispatch.clone(),
            },
            LocalStockClient::new(fx.ledger.clone()),
            Duration::from_secs(2),
        );
        let plan = orchestrator.suggest_allocation(request.id).await.unwrap();
        let err = orchestrator
            .create_dispatch_task(request.id, plan.lock_items(), "dispatcher")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::Backend(_))), "{err:?}");

        assert!(fx.dispatch.task_for_request(request.id).await.unwrap().is_none());
        let request = fx.orchestrator.get_demand_request(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Approved);

        let attempts = fx.orchestrator.attempts_for_request(request.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::LockOrphaned);
        assert!(attempts[0].lock_released_at.is_some());

        let unit = fx.ledger.get_unit(unit.id).await.unwrap();
        assert_eq!(unit.locked_quantity, 0);
        assert!(fx.ledger.verify_unit_ledger(unit.id).await.unwrap().consistent);

        let stale_before = Utc::now() + chrono::Duration::seconds(60);
        assert!(
            fx.dispatch
                .attempts_needing_attention(stale_before)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
