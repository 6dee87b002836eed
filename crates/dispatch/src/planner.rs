//! FEFO (first-expiring-first-out) allocation planner.
//!
//! Units are consumed in ascending order of expiry date, then location name.
//! Units without an expiry date sort as if they expired on
//! [`no_expiry_sentinel`], so they are used last. The order minimizes
//! spoilage of near-expiry stock and must stay exactly as is.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use supplyline_core::InventoryUnitId;
use supplyline_stock::{InventoryItemView, LockItem};

/// Expiry used for units that never expire: 2100-01-01.
pub fn no_expiry_sentinel() -> NaiveDate {
    NaiveDate::from_ymd_opt(2100, 1, 1).unwrap_or(NaiveDate::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub inventory_unit_id: InventoryUnitId,
    pub location: String,
    pub batch_label: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub lines: Vec<AllocationLine>,
}

impl AllocationPlan {
    pub fn total(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    /// The plan as submitted to `lockStock`.
    pub fn lock_items(&self) -> Vec<LockItem> {
        self.lines
            .iter()
            .map(|l| LockItem {
                inventory_unit_id: l.inventory_unit_id,
                quantity: l.quantity,
            })
            .collect()
    }
}

/// Not enough available stock. `partial` is what could be found; it is
/// never a valid allocation on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("insufficient stock: missing {missing}")]
pub struct Shortfall {
    pub partial: AllocationPlan,
    pub missing: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("requested quantity must be positive, got {0}")]
    InvalidQuantity(i64),
    #[error(transparent)]
    Shortfall(#[from] Shortfall),
}

/// Plan `requested` units against `units` (all of one material).
pub fn plan_allocation(
    requested: i64,
    units: &[InventoryItemView],
) -> Result<AllocationPlan, PlanError> {
    if requested <= 0 {
        return Err(PlanError::InvalidQuantity(requested));
    }

    let sentinel = no_expiry_sentinel();
    let mut candidates: Vec<&InventoryItemView> =
        units.iter().filter(|u| u.available() > 0).collect();
    candidates.sort_by(|a, b| {
        let ka = (a.expiry_date.unwrap_or(sentinel), a.location.as_str());
        let kb = (b.expiry_date.unwrap_or(sentinel), b.location.as_str());
        ka.cmp(&kb).then_with(|| a.id.cmp(&b.id))
    });

    let mut remaining = requested;
    let mut plan = AllocationPlan::default();
    for unit in candidates {
        if remaining == 0 {
            break;
        }
        let take = unit.available().min(remaining);
        plan.lines.push(AllocationLine {
            inventory_unit_id: unit.id,
            location: unit.location.clone(),
            batch_label: unit.batch_label.clone(),
            expiry_date: unit.expiry_date,
            quantity: take,
        });
        remaining -= take;
    }

    if remaining > 0 {
        return Err(Shortfall {
            partial: plan,
            missing: remaining,
        }
        .into());
    }
    Ok(plan)
}
