//! In-memory stock store for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use supplyline_core::{InventoryUnitId, LockKey, MaterialId, Page, Pagination};
use supplyline_stock::{InventoryUnit, LedgerBalance, Material, StockLock, StockLogEntry};

use crate::store::row_lock::HeldLocks;
use crate::store::{RowLocks, StoreError};

use super::r#trait::{StockStore, StockTx};

type SlotKey = (MaterialId, String);

#[derive(Debug, Default)]
struct StockState {
    materials: HashMap<MaterialId, Material>,
    units: HashMap<InventoryUnitId, InventoryUnit>,
    /// Live unit occupying each (material, location) slot.
    slots: HashMap<SlotKey, InventoryUnitId>,
    entries: Vec<StockLogEntry>,
    locks: HashMap<LockKey, StockLock>,
}

/// Committed state behind an `RwLock`, plus row-lock tables.
///
/// Units are locked by their (material, location) slot, lock records by
/// their key. A transaction stages its writes and applies them in one step
/// at commit, so readers never observe half of a unit of work.
#[derive(Debug, Clone)]
pub struct InMemoryStockStore {
    state: Arc<RwLock<StockState>>,
    slot_locks: Arc<RowLocks<SlotKey>>,
    key_locks: Arc<RowLocks<LockKey>>,
}

impl InMemoryStockStore {
    pub fn new(row_lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(StockState::default())),
            slot_locks: Arc::new(RowLocks::new(row_lock_timeout)),
            key_locks: Arc::new(RowLocks::new(row_lock_timeout)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StockState>, StoreError> {
        read_state(&self.state)
    }
}

impl Default for InMemoryStockStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn read_state(state: &RwLock<StockState>) -> Result<RwLockReadGuard<'_, StockState>, StoreError> {
    state
        .read()
        .map_err(|_| StoreError::Backend("stock state lock poisoned".to_string()))
}

fn write_state(state: &RwLock<StockState>) -> Result<RwLockWriteGuard<'_, StockState>, StoreError> {
    state
        .write()
        .map_err(|_| StoreError::Backend("stock state lock poisoned".to_string()))
}

struct InMemoryStockTx {
    state: Arc<RwLock<StockState>>,
    slot_locks: Arc<RowLocks<SlotKey>>,
    key_locks: Arc<RowLocks<LockKey>>,
    held_slots: HeldLocks<SlotKey>,
    held_keys: HeldLocks<LockKey>,
    materials: Vec<Material>,
    units: HashMap<InventoryUnitId, InventoryUnit>,
    entries: Vec<StockLogEntry>,
    locks: HashMap<LockKey, StockLock>,
}

impl InMemoryStockTx {
    fn staged_unit_at(&self, slot: &SlotKey) -> Option<&InventoryUnit> {
        self.units.values().find(|u| {
            u.deleted_at.is_none() && u.material_id == slot.0 && u.location == slot.1
        })
    }

    fn committed_unit_at(&self, slot: &SlotKey) -> Result<Option<InventoryUnit>, StoreError> {
        let state = read_state(&self.state)?;
        Ok(state
            .slots
            .get(slot)
            .and_then(|id| state.units.get(id))
            .cloned())
    }

    fn unit_exists(&self, id: InventoryUnitId) -> Result<bool, StoreError> {
        Ok(self.units.contains_key(&id) || read_state(&self.state)?.units.contains_key(&id))
    }
}

fn slot_of(unit: &InventoryUnit) -> SlotKey {
    (unit.material_id, unit.location.clone())
}

#[async_trait::async_trait]
impl StockTx for InMemoryStockTx {
    async fn material(&mut self, id: MaterialId) -> Result<Option<Material>, StoreError> {
        if let Some(m) = self.materials.iter().find(|m| m.id == id) {
            return Ok(Some(m.clone()));
        }
        Ok(read_state(&self.state)?.materials.get(&id).cloned())
    }

    async fn insert_material(&mut self, material: &Material) -> Result<(), StoreError> {
        let exists = self.materials.iter().any(|m| m.id == material.id)
            || read_state(&self.state)?.materials.contains_key(&material.id);
        if exists {
            return Err(StoreError::Constraint(format!(
                "material {} already exists",
                material.id
            )));
        }
        self.materials.push(material.clone());
        Ok(())
    }

    async fn unit_for_update(
        &mut self,
        id: InventoryUnitId,
    ) -> Result<Option<InventoryUnit>, StoreError> {
        if let Some(unit) = self.units.get(&id) {
            return Ok(Some(unit.clone()).filter(|u| u.deleted_at.is_none()));
        }
        let slot = match read_state(&self.state)?.units.get(&id) {
            Some(unit) => slot_of(unit),
            None => return Ok(None),
        };
        self.held_slots.lock(&self.slot_locks, &slot).await?;
        // Re-read under the lock: the previous holder may have committed.
        Ok(read_state(&self.state)?
            .units
            .get(&id)
            .filter(|u| u.deleted_at.is_none())
            .cloned())
    }

    async fn unit_at_for_update(
        &mut self,
        material_id: MaterialId,
        location: &str,
    ) -> Result<Option<InventoryUnit>, StoreError> {
        let slot = (material_id, location.to_string());
        self.held_slots.lock(&self.slot_locks, &slot).await?;
        if let Some(unit) = self.staged_unit_at(&slot) {
            return Ok(Some(unit.clone()));
        }
        self.committed_unit_at(&slot)
    }

    async fn insert_unit_if_absent(
        &mut self,
        unit: &InventoryUnit,
    ) -> Result<InventoryUnit, StoreError> {
        let slot = slot_of(unit);
        self.held_slots.lock(&self.slot_locks, &slot).await?;
        if let Some(existing) = self.staged_unit_at(&slot) {
            return Ok(existing.clone());
        }
        if let Some(existing) = self.committed_unit_at(&slot)? {
            return Ok(existing);
        }
        if self.material(unit.material_id).await?.is_none() {
            return Err(StoreError::Constraint(format!(
                "unit references unknown material {}",
                unit.material_id
            )));
        }
        self.units.insert(unit.id, unit.clone());
        Ok(unit.clone())
    }

    async fn update_unit(&mut self, unit: &InventoryUnit) -> Result<(), StoreError> {
        if !self.held_slots.holds(&slot_of(unit)) {
            return Err(StoreError::Backend(format!(
                "unit {} written without its row lock",
                unit.id
            )));
        }
        self.units.insert(unit.id, unit.clone());
        Ok(())
    }

    async fn append_entry(&mut self, entry: &StockLogEntry) -> Result<(), StoreError> {
        if !self.unit_exists(entry.unit_id)? {
            return Err(StoreError::Constraint(format!(
                "ledger entry references unknown unit {}",
                entry.unit_id
            )));
        }
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn stock_lock_for_update(
        &mut self,
        key: LockKey,
    ) -> Result<Option<StockLock>, StoreError> {
        self.held_keys.lock(&self.key_locks, &key).await?;
        if let Some(lock) = self.locks.get(&key) {
            return Ok(Some(lock.clone()));
        }
        Ok(read_state(&self.state)?.locks.get(&key).cloned())
    }

    async fn upsert_stock_lock(&mut self, lock: &StockLock) -> Result<(), StoreError> {
        if !self.held_keys.holds(&lock.key) {
            return Err(StoreError::Backend(format!(
                "lock record {} written without its row lock",
                lock.key
            )));
        }
        self.locks.insert(lock.key, lock.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let tx = *self;
        if let Some(bad) = tx
            .units
            .values()
            .find(|u| u.locked_quantity < 0 || u.locked_quantity > u.quantity)
        {
            return Err(StoreError::Constraint(format!(
                "unit {}: locked {} outside 0..={}",
                bad.id, bad.locked_quantity, bad.quantity
            )));
        }

        let mut state = write_state(&tx.state)?;
        for material in tx.materials {
            state.materials.insert(material.id, material);
        }
        for (id, unit) in tx.units {
            let slot = slot_of(&unit);
            if unit.deleted_at.is_none() {
                state.slots.insert(slot, id);
            } else if state.slots.get(&slot) == Some(&id) {
                state.slots.remove(&slot);
            }
            state.units.insert(id, unit);
        }
        state.entries.extend(tx.entries);
        for (key, lock) in tx.locks {
            state.locks.insert(key, lock);
        }
        // Row guards in `held_slots`/`held_keys` drop with `tx` after the
        // state lock is released.
        drop(state);
        Ok(())
    }
}

#[async_trait::async_trait]
impl StockStore for InMemoryStockStore {
    async fn begin(&self) -> Result<Box<dyn StockTx>, StoreError> {
        Ok(Box::new(InMemoryStockTx {
            state: self.state.clone(),
            slot_locks: self.slot_locks.clone(),
            key_locks: self.key_locks.clone(),
            held_slots: HeldLocks::default(),
            held_keys: HeldLocks::default(),
            materials: Vec::new(),
            units: HashMap::new(),
            entries: Vec::new(),
            locks: HashMap::new(),
        }))
    }

    async fn get_material(&self, id: MaterialId) -> Result<Option<Material>, StoreError> {
        Ok(self.read()?.materials.get(&id).cloned())
    }

    async fn list_materials(&self, page: Pagination) -> Result<Page<Material>, StoreError> {
        let state = self.read()?;
        let mut all: Vec<Material> = state.materials.values().cloned().collect();
        all.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(Page::new(page.slice(&all), all.len() as u64, page))
    }

    async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError> {
        Ok(self.read()?.units.get(&id).cloned())
    }

    async fn list_units(&self, page: Pagination) -> Result<Page<InventoryUnit>, StoreError> {
        let state = self.read()?;
        let mut live: Vec<InventoryUnit> = state
            .units
            .values()
            .filter(|u| u.deleted_at.is_none())
            .cloned()
            .collect();
        live.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(Page::new(page.slice(&live), live.len() as u64, page))
    }

    async fn units_by_material(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        let state = self.read()?;
        let mut units: Vec<InventoryUnit> = state
            .units
            .values()
            .filter(|u| u.material_id == material_id && u.deleted_at.is_none())
            .cloned()
            .collect();
        units.sort_by(|a, b| (a.updated_at, a.id).cmp(&(b.updated_at, b.id)));
        Ok(units)
    }

    async fn unit_entries(
        &self,
        unit_id: InventoryUnitId,
        page: Pagination,
    ) -> Result<Page<StockLogEntry>, StoreError> {
        let state = self.read()?;
        let entries: Vec<StockLogEntry> = state
            .entries
            .iter()
            .filter(|e| e.unit_id == unit_id)
            .cloned()
            .collect();
        Ok(Page::new(page.slice(&entries), entries.len() as u64, page))
    }

    async fn ledger_balance(&self, unit_id: InventoryUnitId) -> Result<LedgerBalance, StoreError> {
        let state = self.read()?;
        Ok(LedgerBalance::replay(
            state.entries.iter().filter(|e| e.unit_id == unit_id),
        ))
    }

    async fn get_stock_lock(&self, key: LockKey) -> Result<Option<StockLock>, StoreError> {
        Ok(self.read()?.locks.get(&key).cloned())
    }
}
