use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{InventoryUnitId, MaterialId};
use supplyline_events::Event;

use crate::unit::InventoryUnit;

/// Raised after a committed outbound or transfer leaves a unit below its
/// alert threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub material_id: MaterialId,
    pub unit_id: InventoryUnitId,
    pub location: String,
    pub quantity: i64,
    pub alert_threshold: i64,
    pub occurred_at: DateTime<Utc>,
}

impl LowStockAlert {
    pub fn check(unit: &InventoryUnit) -> Option<Self> {
        unit.is_below_alert().then(|| Self {
            material_id: unit.material_id,
            unit_id: unit.id,
            location: unit.location.clone(),
            quantity: unit.quantity,
            alert_threshold: unit.alert_threshold,
            occurred_at: unit.updated_at,
        })
    }
}

impl Event for LowStockAlert {
    fn event_type(&self) -> &'static str {
        "stock.low_stock"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
