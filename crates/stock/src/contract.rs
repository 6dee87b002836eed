//! Wire types of the remote stock contract consumed by the dispatch side.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use supplyline_core::{InventoryUnitId, LockKey, MaterialId, RequestId};

use crate::material::Material;
use crate::unit::InventoryUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockItem {
    pub inventory_unit_id: InventoryUnitId,
    pub quantity: i64,
}

/// All-or-nothing reservation of `items` for `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStockRequest {
    pub request_id: RequestId,
    /// Idempotency key. Replaying the same key with the same items succeeds
    /// without reserving twice.
    pub lock_key: LockKey,
    pub items: Vec<LockItem>,
}

/// `success = false` is an explicit, definitive refusal; `message` says
/// which item failed and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStockResponse {
    pub success: bool,
    pub message: String,
}

impl LockStockResponse {
    pub fn locked() -> Self {
        Self {
            success: true,
            message: "stock locked".to_string(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseLockRequest {
    pub lock_key: LockKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseLockResponse {
    /// True once nothing is held under the key any more.
    pub released: bool,
    pub message: String,
}

/// One inventory unit as seen by the allocation planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItemView {
    pub id: InventoryUnitId,
    pub material_id: MaterialId,
    pub location: String,
    pub quantity: i64,
    pub locked_quantity: i64,
    pub batch_label: Option<String>,
    pub expiry_date: Option<NaiveDate>,
}

impl InventoryItemView {
    pub fn new(unit: &InventoryUnit, material: &Material) -> Self {
        Self {
            id: unit.id,
            material_id: unit.material_id,
            location: unit.location.clone(),
            quantity: unit.quantity,
            locked_quantity: unit.locked_quantity,
            batch_label: material.batch_label.clone(),
            expiry_date: material.expiry_date,
        }
    }

    pub fn available(&self) -> i64 {
        self.quantity - self.locked_quantity
    }
}
