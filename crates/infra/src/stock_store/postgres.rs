//! Postgres-backed stock store.
//!
//! Row locks are real `SELECT ... FOR UPDATE` locks bounded by the
//! transaction's `lock_timeout`. Slots that may not have a row yet (a unit
//! about to be created, a lock key seen for the first time) are serialized
//! with transaction-scoped advisory locks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};
use uuid::Uuid;

use supplyline_core::{InventoryUnitId, LockKey, MaterialId, Page, Pagination, RequestId, StockLogId};
use supplyline_stock::{
    InventoryUnit, LedgerBalance, LockLine, LockStatus, Material, StockLock, StockLogEntry,
    StockLogKind,
};

use crate::store::StoreError;
use crate::store::pg::{begin_with_lock_timeout, ensure_schema, map_sqlx_error, to_i64, to_u64};

use super::r#trait::{StockStore, StockTx};

const UNIT_COLUMNS: &str = "id, material_id, location, quantity, locked_quantity, \
     alert_threshold, version, created_at, updated_at, deleted_at";

const MATERIAL_COLUMNS: &str = "id, name, category, unit, batch_label, expiry_date, \
     alert_threshold, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        ensure_schema(&self.pool, "stock", super::SCHEMA).await
    }
}

struct PgStockTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl StockTx for PgStockTx {
    async fn material(&mut self, id: MaterialId) -> Result<Option<Material>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MATERIAL_COLUMNS} FROM materials WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("material", e))?;
        row.map(|r| decode::<MaterialRow>(&r).map(Material::from))
            .transpose()
    }

    async fn insert_material(&mut self, material: &Material) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO materials (
                id, name, category, unit, batch_label, expiry_date,
                alert_threshold, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(material.id.as_uuid())
        .bind(&material.name)
        .bind(&material.category)
        .bind(&material.unit)
        .bind(&material.batch_label)
        .bind(material.expiry_date)
        .bind(material.alert_threshold)
        .bind(material.created_at)
        .bind(material.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_material", e))?;
        Ok(())
    }

    async fn unit_for_update(
        &mut self,
        id: InventoryUnitId,
    ) -> Result<Option<InventoryUnit>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM inventory_units \
             WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("unit_for_update", e))?;
        row.map(|r| decode::<UnitRow>(&r).map(InventoryUnit::from))
            .transpose()
    }

    async fn unit_at_for_update(
        &mut self,
        material_id: MaterialId,
        location: &str,
    ) -> Result<Option<InventoryUnit>, StoreError> {
        lock_slot(&mut self.tx, material_id, location).await?;
        let row = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM inventory_units \
             WHERE material_id = $1 AND location = $2 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(material_id.as_uuid())
        .bind(location)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("unit_at_for_update", e))?;
        row.map(|r| decode::<UnitRow>(&r).map(InventoryUnit::from))
            .transpose()
    }

    async fn insert_unit_if_absent(
        &mut self,
        unit: &InventoryUnit,
    ) -> Result<InventoryUnit, StoreError> {
        lock_slot(&mut self.tx, unit.material_id, &unit.location).await?;
        sqlx::query(
            r#"
            INSERT INTO inventory_units (
                id, material_id, location, quantity, locked_quantity,
                alert_threshold, version, created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (material_id, location) WHERE deleted_at IS NULL DO NOTHING
            "#,
        )
        .bind(unit.id.as_uuid())
        .bind(unit.material_id.as_uuid())
        .bind(&unit.location)
        .bind(unit.quantity)
        .bind(unit.locked_quantity)
        .bind(unit.alert_threshold)
        .bind(to_i64(unit.version))
        .bind(unit.created_at)
        .bind(unit.updated_at)
        .bind(unit.deleted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_unit_if_absent", e))?;

        self.unit_at_for_update(unit.material_id, &unit.location)
            .await?
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "unit slot {}/{} empty after insert",
                    unit.material_id, unit.location
                ))
            })
    }

    async fn update_unit(&mut self, unit: &InventoryUnit) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_units
            SET quantity = $2,
                locked_quantity = $3,
                alert_threshold = $4,
                version = $5,
                updated_at = $6,
                deleted_at = $7
            WHERE id = $1
            "#,
        )
        .bind(unit.id.as_uuid())
        .bind(unit.quantity)
        .bind(unit.locked_quantity)
        .bind(unit.alert_threshold)
        .bind(to_i64(unit.version))
        .bind(unit.updated_at)
        .bind(unit.deleted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_unit", e))?;
        if result.rows_affected() != 1 {
            return Err(StoreError::Backend(format!("unit {} vanished", unit.id)));
        }
        Ok(())
    }

    async fn append_entry(&mut self, entry: &StockLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_log_entries (
                id, material_id, unit_id, kind, delta, balance_after,
                available_after, operator, related_order, remark, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.material_id.as_uuid())
        .bind(entry.unit_id.as_uuid())
        .bind(entry.kind.as_str())
        .bind(entry.delta)
        .bind(entry.balance_after)
        .bind(entry.available_after)
        .bind(&entry.operator)
        .bind(&entry.related_order)
        .bind(&entry.remark)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_entry", e))?;
        Ok(())
    }

    async fn stock_lock_for_update(
        &mut self,
        key: LockKey,
    ) -> Result<Option<StockLock>, StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 1))")
            .bind(key.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_key", e))?;
        let row = sqlx::query(
            r#"
            SELECT lock_key, request_id, lines, status, created_at, released_at
            FROM stock_locks
            WHERE lock_key = $1
            FOR UPDATE
            "#,
        )
        .bind(key.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("stock_lock_for_update", e))?;
        row.map(|r| decode::<LockRow>(&r).and_then(StockLock::try_from))
            .transpose()
    }

    async fn upsert_stock_lock(&mut self, lock: &StockLock) -> Result<(), StoreError> {
        let lines = serde_json::to_value(&lock.lines)
            .map_err(|e| StoreError::Backend(format!("encode lock lines: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO stock_locks (lock_key, request_id, lines, status, created_at, released_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (lock_key) DO UPDATE
            SET request_id = EXCLUDED.request_id,
                lines = EXCLUDED.lines,
                status = EXCLUDED.status,
                released_at = EXCLUDED.released_at
            "#,
        )
        .bind(lock.key.as_uuid())
        .bind(lock.request_id.map(|id| *id.as_uuid()))
        .bind(lines)
        .bind(lock.status.as_str())
        .bind(lock.created_at)
        .bind(lock.released_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_stock_lock", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

/// Serialize creators of the same (material, location) slot.
async fn lock_slot(
    tx: &mut Transaction<'static, Postgres>,
    material_id: MaterialId,
    location: &str,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text || '/' || $2, 0))")
        .bind(material_id.as_uuid())
        .bind(location)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_slot", e))?;
    Ok(())
}

fn decode<T>(row: &PgRow) -> Result<T, StoreError>
where
    T: for<'r> FromRow<'r, PgRow>,
{
    T::from_row(row).map_err(|e| StoreError::Corrupt(format!("failed to decode row: {e}")))
}

#[async_trait::async_trait]
impl StockStore for PostgresStockStore {
    async fn begin(&self) -> Result<Box<dyn StockTx>, StoreError> {
        let tx = begin_with_lock_timeout(&self.pool, self.lock_timeout).await?;
        Ok(Box::new(PgStockTx { tx }))
    }

    #[instrument(skip(self), fields(material_id = %id), err)]
    async fn get_material(&self, id: MaterialId) -> Result<Option<Material>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MATERIAL_COLUMNS} FROM materials WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_material", e))?;
        row.map(|r| decode::<MaterialRow>(&r).map(Material::from))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_materials(&self, page: Pagination) -> Result<Page<Material>, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM materials")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_materials", e))?;
        let rows = sqlx::query(&format!(
            "SELECT {MATERIAL_COLUMNS} FROM materials \
             ORDER BY created_at ASC, id ASC LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_materials", e))?;
        let items = rows
            .iter()
            .map(|r| decode::<MaterialRow>(r).map(Material::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    #[instrument(skip(self), fields(unit_id = %id), err)]
    async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM inventory_units WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_unit", e))?;
        row.map(|r| decode::<UnitRow>(&r).map(InventoryUnit::from))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_units(&self, page: Pagination) -> Result<Page<InventoryUnit>, StoreError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM inventory_units WHERE deleted_at IS NULL")
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_units", e))?;
        let rows = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM inventory_units WHERE deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_units", e))?;
        let items = rows
            .iter()
            .map(|r| decode::<UnitRow>(r).map(InventoryUnit::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    #[instrument(skip(self), fields(material_id = %material_id, unit_count = tracing::field::Empty), err)]
    async fn units_by_material(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM inventory_units \
             WHERE material_id = $1 AND deleted_at IS NULL \
             ORDER BY updated_at ASC, id ASC"
        ))
        .bind(material_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("units_by_material", e))?;
        let units = rows
            .iter()
            .map(|r| decode::<UnitRow>(r).map(InventoryUnit::from))
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("unit_count", units.len());
        Ok(units)
    }

    #[instrument(skip(self), fields(unit_id = %unit_id), err)]
    async fn unit_entries(
        &self,
        unit_id: InventoryUnitId,
        page: Pagination,
    ) -> Result<Page<StockLogEntry>, StoreError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stock_log_entries WHERE unit_id = $1")
                .bind(unit_id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_entries", e))?;
        let rows = sqlx::query(
            r#"
            SELECT id, material_id, unit_id, kind, delta, balance_after,
                   available_after, operator, related_order, remark, created_at
            FROM stock_log_entries
            WHERE unit_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(unit_id.as_uuid())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unit_entries", e))?;
        let items = rows
            .iter()
            .map(|r| decode::<EntryRow>(r).and_then(StockLogEntry::try_from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, to_u64(total), page))
    }

    #[instrument(skip(self), fields(unit_id = %unit_id), err)]
    async fn ledger_balance(&self, unit_id: InventoryUnitId) -> Result<LedgerBalance, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(delta) FILTER (WHERE kind IN ('inbound', 'outbound', 'transfer')), 0)::BIGINT AS on_hand,
                COALESCE(SUM(delta), 0)::BIGINT AS available
            FROM stock_log_entries
            WHERE unit_id = $1
            "#,
        )
        .bind(unit_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_balance", e))?;
        Ok(LedgerBalance {
            on_hand: row
                .try_get("on_hand")
                .map_err(|e| map_sqlx_error("ledger_balance", e))?,
            available: row
                .try_get("available")
                .map_err(|e| map_sqlx_error("ledger_balance", e))?,
        })
    }

    #[instrument(skip(self), fields(lock_key = %key), err)]
    async fn get_stock_lock(&self, key: LockKey) -> Result<Option<StockLock>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT lock_key, request_id, lines, status, created_at, released_at
            FROM stock_locks
            WHERE lock_key = $1
            "#,
        )
        .bind(key.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_stock_lock", e))?;
        row.map(|r| decode::<LockRow>(&r).and_then(StockLock::try_from))
            .transpose()
    }
}

struct MaterialRow {
    id: Uuid,
    name: String,
    category: String,
    unit: String,
    batch_label: Option<String>,
    expiry_date: Option<NaiveDate>,
    alert_threshold: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for MaterialRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            category: row.try_get("category")?,
            unit: row.try_get("unit")?,
            batch_label: row.try_get("batch_label")?,
            expiry_date: row.try_get("expiry_date")?,
            alert_threshold: row.try_get("alert_threshold")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<MaterialRow> for Material {
    fn from(row: MaterialRow) -> Self {
        Material {
            id: MaterialId::from_uuid(row.id),
            name: row.name,
            category: row.category,
            unit: row.unit,
            batch_label: row.batch_label,
            expiry_date: row.expiry_date,
            alert_threshold: row.alert_threshold,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

struct UnitRow {
    id: Uuid,
    material_id: Uuid,
    location: String,
    quantity: i64,
    locked_quantity: i64,
    alert_threshold: i64,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for UnitRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            material_id: row.try_get("material_id")?,
            location: row.try_get("location")?,
            quantity: row.try_get("quantity")?,
            locked_quantity: row.try_get("locked_quantity")?,
            alert_threshold: row.try_get("alert_threshold")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl From<UnitRow> for InventoryUnit {
    fn from(row: UnitRow) -> Self {
        InventoryUnit {
            id: InventoryUnitId::from_uuid(row.id),
            material_id: MaterialId::from_uuid(row.material_id),
            location: row.location,
            quantity: row.quantity,
            locked_quantity: row.locked_quantity,
            alert_threshold: row.alert_threshold,
            version: to_u64(row.version),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

struct EntryRow {
    id: Uuid,
    material_id: Uuid,
    unit_id: Uuid,
    kind: String,
    delta: i64,
    balance_after: i64,
    available_after: i64,
    operator: String,
    related_order: Option<String>,
    remark: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            material_id: row.try_get("material_id")?,
            unit_id: row.try_get("unit_id")?,
            kind: row.try_get("kind")?,
            delta: row.try_get("delta")?,
            balance_after: row.try_get("balance_after")?,
            available_after: row.try_get("available_after")?,
            operator: row.try_get("operator")?,
            related_order: row.try_get("related_order")?,
            remark: row.try_get("remark")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EntryRow> for StockLogEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let kind = StockLogKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown ledger kind '{}'", row.kind)))?;
        Ok(StockLogEntry {
            id: StockLogId::from_uuid(row.id),
            material_id: MaterialId::from_uuid(row.material_id),
            unit_id: InventoryUnitId::from_uuid(row.unit_id),
            kind,
            delta: row.delta,
            balance_after: row.balance_after,
            available_after: row.available_after,
            operator: row.operator,
            related_order: row.related_order,
            remark: row.remark,
            created_at: row.created_at,
        })
    }
}

struct LockRow {
    lock_key: Uuid,
    request_id: Option<Uuid>,
    lines: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for LockRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            lock_key: row.try_get("lock_key")?,
            request_id: row.try_get("request_id")?,
            lines: row.try_get("lines")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            released_at: row.try_get("released_at")?,
        })
    }
}

impl TryFrom<LockRow> for StockLock {
    type Error = StoreError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        let lines: Vec<LockLine> = serde_json::from_value(row.lines)
            .map_err(|e| StoreError::Corrupt(format!("lock {} lines: {e}", row.lock_key)))?;
        let status = LockStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown lock status '{}'", row.status)))?;
        Ok(StockLock {
            key: LockKey::from_uuid(row.lock_key),
            request_id: row.request_id.map(RequestId::from_uuid),
            lines,
            status,
            created_at: row.created_at,
            released_at: row.released_at,
        })
    }
}
