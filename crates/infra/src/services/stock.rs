//! Stock ledger service.
//!
//! Owns every mutation of inventory units. Each operation is one stock unit
//! of work: rows are locked, the unit is changed through its domain methods,
//! the resulting movement is appended to the ledger, and everything commits
//! together or not at all.
//!
//! Multi-row operations take their row locks in ascending unit id order.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use supplyline_core::{
    DomainError, InventoryUnitId, LockKey, MaterialId, Page, Pagination,
};
use supplyline_events::{EventBus, InMemoryEventBus};
use supplyline_stock::{
    EntryContext, InventoryItemView, InventoryUnit, LedgerBalance, LockStatus, LockStockRequest,
    LowStockAlert, Material, NewMaterial, StockLock, StockLogEntry, StockLogKind, normalize_lines,
    normalize_location,
};

use crate::stock_store::{StockStore, StockTx};
use crate::store::StoreError;

/// Operator recorded on lock and release ledger entries.
pub const LOCK_OPERATOR: &str = "dispatch";

#[derive(Debug, Error)]
pub enum StockError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for StockError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(m) | DomainError::InvalidId(m) => StockError::Validation(m),
            DomainError::NotFound(m) => StockError::NotFound(m),
            DomainError::Conflict(m) => StockError::Conflict(m),
            DomainError::InsufficientStock(m) => StockError::InsufficientStock(m),
            DomainError::InvariantViolation(m) | DomainError::InvalidTransition(m) => {
                StockError::Invariant(m)
            }
        }
    }
}

impl StockError {
    /// A definite "no": the unit of work rolled back and a retry with the
    /// same input would fail the same way (or, for lock timeouts, may be
    /// retried by hand). Everything else is an infrastructure fault with an
    /// unknown effect on the caller's side.
    pub fn is_refusal(&self) -> bool {
        match self {
            StockError::Store(StoreError::LockTimeout(_) | StoreError::Constraint(_)) => true,
            StockError::Store(_) => false,
            _ => true,
        }
    }
}

/// Alert bus shared by the ledger and its subscribers.
pub type AlertBus = Arc<InMemoryEventBus<LowStockAlert>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundCommand {
    pub material_id: MaterialId,
    pub location: String,
    pub quantity: i64,
    pub operator: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub related_order: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub material_id: MaterialId,
    pub location: String,
    pub quantity: i64,
    pub operator: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub related_order: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCommand {
    pub material_id: MaterialId,
    pub from_location: String,
    pub to_location: String,
    pub quantity: i64,
    pub operator: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub related_order: Option<String>,
}

fn entry_context(operator: &str, remark: &str, related_order: Option<&String>) -> EntryContext {
    let ctx = EntryContext::new(operator, remark);
    match related_order {
        Some(order) => ctx.with_related_order(order.clone()),
        None => ctx,
    }
}

fn transfer_remark(prefix: String, remark: &str) -> String {
    if remark.trim().is_empty() {
        prefix
    } else {
        format!("{prefix}: {remark}")
    }
}

/// A unit after a single-row operation, with the ledger entry it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockChange {
    pub unit: InventoryUnit,
    pub entry: StockLogEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub from: InventoryUnit,
    pub to: InventoryUnit,
    /// Source entry first.
    pub entries: Vec<StockLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Locked(StockLock),
    /// Same key and lines as an earlier successful call; nothing was reserved again.
    Replayed(StockLock),
}

impl LockOutcome {
    pub fn lock(&self) -> &StockLock {
        match self {
            LockOutcome::Locked(lock) | LockOutcome::Replayed(lock) => lock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(StockLock),
    AlreadyReleased,
    /// Nothing was held under the key; a tombstone now refuses late lock calls.
    Tombstoned,
}

impl ReleaseOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            ReleaseOutcome::Released(_) => "lock released",
            ReleaseOutcome::AlreadyReleased => "lock already released",
            ReleaseOutcome::Tombstoned => "no lock held under key; key retired",
        }
    }
}

/// Unit balances next to the balances rebuilt from its ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerCheck {
    pub unit_id: InventoryUnitId,
    pub on_hand: i64,
    pub available: i64,
    pub ledger: LedgerBalance,
    pub consistent: bool,
}

pub struct StockLedger<S, B = AlertBus> {
    store: S,
    alerts: B,
}

impl<S, B> StockLedger<S, B>
where
    S: StockStore,
    B: EventBus<LowStockAlert>,
{
    pub fn new(store: S, alerts: B) -> Self {
        Self { store, alerts }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn alerts(&self) -> &B {
        &self.alerts
    }

    #[instrument(skip(self, new), fields(name = %new.name), err)]
    pub async fn register_material(&self, new: NewMaterial) -> Result<Material, StockError> {
        let material = new.into_material(Utc::now())?;
        let mut tx = self.store.begin().await?;
        tx.insert_material(&material).await?;
        tx.commit().await?;
        info!(material_id = %material.id, "material registered");
        Ok(material)
    }

    pub async fn get_material(&self, id: MaterialId) -> Result<Material, StockError> {
        self.store
            .get_material(id)
            .await?
            .ok_or_else(|| StockError::NotFound(format!("material {id}")))
    }

    pub async fn list_materials(&self, page: Pagination) -> Result<Page<Material>, StockError> {
        Ok(self.store.list_materials(page).await?)
    }

    /// Receive stock at a location, opening the unit if needed.
    #[instrument(
        skip(self, cmd),
        fields(material_id = %cmd.material_id, location = %cmd.location, quantity = cmd.quantity),
        err
    )]
    pub async fn inbound(&self, cmd: InboundCommand) -> Result<StockChange, StockError> {
        let location = normalize_location(&cmd.location)?;
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let material = load_material(tx.as_mut(), cmd.material_id).await?;
        let mut unit = match tx.unit_at_for_update(material.id, &location).await? {
            Some(unit) => unit,
            None => {
                let fresh = InventoryUnit::open(&material, &location, now)?;
                tx.insert_unit_if_absent(&fresh).await?
            }
        };

        let movement = unit.receive(cmd.quantity, now)?;
        tx.update_unit(&unit).await?;
        let ctx = entry_context(&cmd.operator, &cmd.remark, cmd.related_order.as_ref());
        let entry = StockLogEntry::record(&unit, StockLogKind::Inbound, movement, &ctx, now);
        tx.append_entry(&entry).await?;
        tx.commit().await?;

        info!(unit_id = %unit.id, on_hand = unit.quantity, "stock received");
        Ok(StockChange { unit, entry })
    }

    /// Issue unreserved stock from a location.
    #[instrument(
        skip(self, cmd),
        fields(material_id = %cmd.material_id, location = %cmd.location, quantity = cmd.quantity),
        err
    )]
    pub async fn outbound(&self, cmd: OutboundCommand) -> Result<StockChange, StockError> {
        let location = normalize_location(&cmd.location)?;
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut unit = tx
            .unit_at_for_update(cmd.material_id, &location)
            .await?
            .ok_or_else(|| {
                StockError::NotFound(format!(
                    "no inventory unit of material {} at {location}",
                    cmd.material_id
                ))
            })?;

        let movement = unit.issue(cmd.quantity, now)?;
        tx.update_unit(&unit).await?;
        let ctx = entry_context(&cmd.operator, &cmd.remark, cmd.related_order.as_ref());
        let entry = StockLogEntry::record(&unit, StockLogKind::Outbound, movement, &ctx, now);
        tx.append_entry(&entry).await?;
        tx.commit().await?;

        info!(unit_id = %unit.id, on_hand = unit.quantity, "stock issued");
        self.signal_low_stock(&unit);
        Ok(StockChange { unit, entry })
    }

    /// Move stock between two locations of the same material.
    #[instrument(
        skip(self, cmd),
        fields(
            material_id = %cmd.material_id,
            from = %cmd.from_location,
            to = %cmd.to_location,
            quantity = cmd.quantity
        ),
        err
    )]
    pub async fn transfer(&self, cmd: TransferCommand) -> Result<TransferOutcome, StockError> {
        let from = normalize_location(&cmd.from_location)?;
        let to = normalize_location(&cmd.to_location)?;
        if from == to {
            return Err(StockError::Validation(format!(
                "cannot transfer from {from} to itself"
            )));
        }
        if cmd.quantity <= 0 {
            return Err(StockError::Validation(format!(
                "quantity must be positive, got {}",
                cmd.quantity
            )));
        }

        // Committed ids decide the lock order; a destination that does not
        // exist yet gets a fresh id and is locked last.
        let committed = self.store.units_by_material(cmd.material_id).await?;
        let id_at = |loc: &str| committed.iter().find(|u| u.location == loc).map(|u| u.id);
        let destination_first = matches!(
            (id_at(&from), id_at(&to)),
            (Some(src), Some(dst)) if dst < src
        );

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let material = load_material(tx.as_mut(), cmd.material_id).await?;

        let (source, destination) = if destination_first {
            let destination = tx.unit_at_for_update(material.id, &to).await?;
            let source = tx.unit_at_for_update(material.id, &from).await?;
            (source, destination)
        } else {
            let source = tx.unit_at_for_update(material.id, &from).await?;
            let destination = tx.unit_at_for_update(material.id, &to).await?;
            (source, destination)
        };
        let mut source = source.ok_or_else(|| {
            StockError::NotFound(format!(
                "no inventory unit of material {} at {from}",
                material.id
            ))
        })?;
        let mut destination = match destination {
            Some(unit) => unit,
            None => {
                let fresh = InventoryUnit::open(&material, &to, now)?;
                tx.insert_unit_if_absent(&fresh).await?
            }
        };

        let out = source.issue(cmd.quantity, now)?;
        let inn = destination.receive(cmd.quantity, now)?;
        tx.update_unit(&source).await?;
        tx.update_unit(&destination).await?;

        let base = entry_context(&cmd.operator, &cmd.remark, cmd.related_order.as_ref());
        let out_ctx = base.with_remark(transfer_remark(format!("Transfer to {to}"), &cmd.remark));
        let in_ctx = base.with_remark(transfer_remark(format!("Transfer from {from}"), &cmd.remark));
        let entries = vec![
            StockLogEntry::record(&source, StockLogKind::Transfer, out, &out_ctx, now),
            StockLogEntry::record(&destination, StockLogKind::Transfer, inn, &in_ctx, now),
        ];
        for entry in &entries {
            tx.append_entry(entry).await?;
        }
        tx.commit().await?;

        info!(
            from_unit = %source.id,
            to_unit = %destination.id,
            "stock transferred"
        );
        self.signal_low_stock(&source);
        Ok(TransferOutcome {
            from: source,
            to: destination,
            entries,
        })
    }

    /// Reserve every line of `req` or nothing.
    ///
    /// `lock_key` makes the call idempotent: a replay with the same request
    /// and lines succeeds without reserving again, a key that was released
    /// (or tombstoned) is refused.
    #[instrument(
        skip(self, req),
        fields(request_id = %req.request_id, lock_key = %req.lock_key, items = req.items.len()),
        err
    )]
    pub async fn lock_stock(&self, req: &LockStockRequest) -> Result<LockOutcome, StockError> {
        let lines = normalize_lines(&req.items)?;
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        if let Some(existing) = tx.stock_lock_for_update(req.lock_key).await? {
            if existing.status == LockStatus::Released {
                return Err(StockError::Conflict(format!(
                    "lock {} was released",
                    req.lock_key
                )));
            }
            if existing.is_replay_of(req.request_id, &lines) {
                debug!("lock call replayed");
                return Ok(LockOutcome::Replayed(existing));
            }
            return Err(StockError::Conflict(format!(
                "lock {} already holds a different allocation",
                req.lock_key
            )));
        }

        let ctx = EntryContext::new(LOCK_OPERATOR, format!("Lock for request {}", req.request_id))
            .with_related_order(req.request_id.to_string());
        for line in &lines {
            let mut unit = tx
                .unit_for_update(line.unit_id)
                .await?
                .ok_or_else(|| StockError::NotFound(format!("inventory unit {}", line.unit_id)))?;
            let movement = unit.reserve(line.quantity, now)?;
            tx.update_unit(&unit).await?;
            tx.append_entry(&StockLogEntry::record(
                &unit,
                StockLogKind::Lock,
                movement,
                &ctx,
                now,
            ))
            .await?;
        }

        let lock = StockLock::held(req.lock_key, req.request_id, lines, now);
        tx.upsert_stock_lock(&lock).await?;
        tx.commit().await?;

        info!(units = lock.lines.len(), "stock locked");
        Ok(LockOutcome::Locked(lock))
    }

    /// Return everything held under `key` to availability.
    #[instrument(skip(self), fields(lock_key = %key), err)]
    pub async fn release_lock(&self, key: LockKey) -> Result<ReleaseOutcome, StockError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let Some(mut lock) = tx.stock_lock_for_update(key).await? else {
            tx.upsert_stock_lock(&StockLock::tombstone(key, now)).await?;
            tx.commit().await?;
            info!("release for unknown key, tombstone written");
            return Ok(ReleaseOutcome::Tombstoned);
        };
        if lock.status == LockStatus::Released {
            return Ok(ReleaseOutcome::AlreadyReleased);
        }

        let mut ctx = EntryContext::new(LOCK_OPERATOR, format!("Release lock {key}"));
        if let Some(request_id) = lock.request_id {
            ctx = ctx.with_related_order(request_id.to_string());
        }
        for line in &lock.lines {
            let mut unit = tx.unit_for_update(line.unit_id).await?.ok_or_else(|| {
                StockError::Invariant(format!(
                    "lock {key} references missing unit {}",
                    line.unit_id
                ))
            })?;
            let movement = unit.release(line.quantity, now)?;
            tx.update_unit(&unit).await?;
            tx.append_entry(&StockLogEntry::record(
                &unit,
                StockLogKind::Release,
                movement,
                &ctx,
                now,
            ))
            .await?;
        }
        lock.mark_released(now);
        tx.upsert_stock_lock(&lock).await?;
        tx.commit().await?;

        info!(units = lock.lines.len(), "stock lock released");
        Ok(ReleaseOutcome::Released(lock))
    }

    pub async fn lock_status(&self, key: LockKey) -> Result<Option<StockLock>, StockError> {
        Ok(self.store.get_stock_lock(key).await?)
    }

    /// Live units of a material joined with its batch data, least recently
    /// updated first. Unknown materials have no units.
    #[instrument(skip(self), fields(material_id = %material_id), err)]
    pub async fn list_inventory_items(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryItemView>, StockError> {
        let Some(material) = self.store.get_material(material_id).await? else {
            return Ok(Vec::new());
        };
        let units = self.store.units_by_material(material_id).await?;
        Ok(units
            .iter()
            .map(|unit| InventoryItemView::new(unit, &material))
            .collect())
    }

    pub async fn get_unit(&self, id: InventoryUnitId) -> Result<InventoryUnit, StockError> {
        self.store
            .get_unit(id)
            .await?
            .ok_or_else(|| StockError::NotFound(format!("inventory unit {id}")))
    }

    pub async fn list_units(&self, page: Pagination) -> Result<Page<InventoryUnit>, StockError> {
        Ok(self.store.list_units(page).await?)
    }

    pub async fn unit_ledger(
        &self,
        unit_id: InventoryUnitId,
        page: Pagination,
    ) -> Result<Page<StockLogEntry>, StockError> {
        self.get_unit(unit_id).await?;
        Ok(self.store.unit_entries(unit_id, page).await?)
    }

    /// Rebuild a unit's balances from its ledger and compare.
    pub async fn verify_unit_ledger(&self, unit_id: InventoryUnitId) -> Result<LedgerCheck, StockError> {
        let unit = self.get_unit(unit_id).await?;
        let ledger = self.store.ledger_balance(unit_id).await?;
        let consistent = ledger.matches(&unit);
        if !consistent {
            warn!(unit_id = %unit_id, ?ledger, on_hand = unit.quantity, "ledger does not match unit");
        }
        Ok(LedgerCheck {
            unit_id,
            on_hand: unit.quantity,
            available: unit.available(),
            ledger,
            consistent,
        })
    }

    /// Publish a low-stock alert for a committed unit. Never fails the caller.
    fn signal_low_stock(&self, unit: &InventoryUnit) {
        let Some(alert) = LowStockAlert::check(unit) else {
            return;
        };
        match self.alerts.publish(alert) {
            Ok(()) => debug!(unit_id = %unit.id, "low-stock alert published"),
            Err(err) => warn!(unit_id = %unit.id, error = ?err, "low-stock alert not published"),
        }
    }
}

async fn load_material(tx: &mut dyn StockTx, id: MaterialId) -> Result<Material, StockError> {
    tx.material(id)
        .await?
        .ok_or_else(|| StockError::NotFound(format!("material {id}")))
}
