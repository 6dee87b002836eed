use std::sync::Arc;

use supplyline_core::{InventoryUnitId, LockKey, MaterialId, Page, Pagination};
use supplyline_stock::{InventoryUnit, LedgerBalance, Material, StockLock, StockLogEntry};

use crate::store::StoreError;

/// One stock unit of work.
///
/// `*_for_update` reads lock the row until commit or drop. Writes become
/// visible to other readers only at `commit`; dropping the transaction
/// discards them and releases every lock it took.
#[async_trait::async_trait]
pub trait StockTx: Send {
    async fn material(&mut self, id: MaterialId) -> Result<Option<Material>, StoreError>;

    async fn insert_material(&mut self, material: &Material) -> Result<(), StoreError>;

    /// Lock and load a live unit by id.
    async fn unit_for_update(
        &mut self,
        id: InventoryUnitId,
    ) -> Result<Option<InventoryUnit>, StoreError>;

    /// Lock and load the live unit for `(material_id, location)`.
    ///
    /// The slot is locked even when no unit exists yet, so a following
    /// `insert_unit_if_absent` cannot race another creator.
    async fn unit_at_for_update(
        &mut self,
        material_id: MaterialId,
        location: &str,
    ) -> Result<Option<InventoryUnit>, StoreError>;

    /// Insert `unit` unless a live unit already occupies its slot; returns
    /// the (locked) unit that ends up in the slot.
    async fn insert_unit_if_absent(
        &mut self,
        unit: &InventoryUnit,
    ) -> Result<InventoryUnit, StoreError>;

    async fn update_unit(&mut self, unit: &InventoryUnit) -> Result<(), StoreError>;

    async fn append_entry(&mut self, entry: &StockLogEntry) -> Result<(), StoreError>;

    /// Lock and load the lock record for `key`. Calls with the same key are
    /// serialized even when no record exists yet.
    async fn stock_lock_for_update(&mut self, key: LockKey)
    -> Result<Option<StockLock>, StoreError>;

    async fn upsert_stock_lock(&mut self, lock: &StockLock) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Stock store: unit-of-work factory plus committed-state reads.
#[async_trait::async_trait]
pub trait StockStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StockTx>, StoreError>;

    async fn get_material(&self, id: MaterialId) -> Result<Option<Material>, StoreError>;

    async fn list_materials(&self, page: Pagination) -> Result<Page<Material>, StoreError>;

    async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError>;

    /// Live units, oldest first.
    async fn list_units(&self, page: Pagination) -> Result<Page<InventoryUnit>, StoreError>;

    /// Live units of one material, least recently updated first.
    async fn units_by_material(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryUnit>, StoreError>;

    /// Ledger of one unit, oldest entry first.
    async fn unit_entries(
        &self,
        unit_id: InventoryUnitId,
        page: Pagination,
    ) -> Result<Page<StockLogEntry>, StoreError>;

    /// Balances rebuilt from the full ledger of one unit.
    async fn ledger_balance(&self, unit_id: InventoryUnitId) -> Result<LedgerBalance, StoreError>;

    async fn get_stock_lock(&self, key: LockKey) -> Result<Option<StockLock>, StoreError>;
}

#[async_trait::async_trait]
impl<S> StockStore for Arc<S>
where
    S: StockStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StockTx>, StoreError> {
        (**self).begin().await
    }

    async fn get_material(&self, id: MaterialId) -> Result<Option<Material>, StoreError> {
        (**self).get_material(id).await
    }

    async fn list_materials(&self, page: Pagination) -> Result<Page<Material>, StoreError> {
        (**self).list_materials(page).await
    }

    async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError> {
        (**self).get_unit(id).await
    }

    async fn list_units(&self, page: Pagination) -> Result<Page<InventoryUnit>, StoreError> {
        (**self).list_units(page).await
    }

    async fn units_by_material(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        (**self).units_by_material(material_id).await
    }

    async fn unit_entries(
        &self,
        unit_id: InventoryUnitId,
        page: Pagination,
    ) -> Result<Page<StockLogEntry>, StoreError> {
        (**self).unit_entries(unit_id, page).await
    }

    async fn ledger_balance(&self, unit_id: InventoryUnitId) -> Result<LedgerBalance, StoreError> {
        (**self).ledger_balance(unit_id).await
    }

    async fn get_stock_lock(&self, key: LockKey) -> Result<Option<StockLock>, StoreError> {
        (**self).get_stock_lock(key).await
    }
}
