use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{DomainError, DomainResult, InventoryUnitId, MaterialId};

use crate::material::Material;

/// Stock of one material held at one location.
///
/// `quantity` is the on-hand total and `locked_quantity` the part of it
/// reserved for dispatch. Only the mutation methods below change either,
/// and each one leaves `0 <= locked_quantity <= quantity` intact or fails
/// without touching the unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnit {
    pub id: InventoryUnitId,
    pub material_id: MaterialId,
    pub location: String,
    pub quantity: i64,
    pub locked_quantity: i64,
    pub alert_threshold: i64,
    /// Revision counter, bumped on every mutation. Informational only; row
    /// locks serialize writers.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Effect of one mutation, as it must be written to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockMovement {
    /// Signed change of available (unreserved) stock.
    pub delta: i64,
    /// On-hand quantity after the mutation.
    pub balance_after: i64,
    /// `quantity - locked_quantity` after the mutation.
    pub available_after: i64,
}

impl InventoryUnit {
    /// Open an empty unit for `material` at `location`.
    pub fn open(material: &Material, location: &str, now: DateTime<Utc>) -> DomainResult<Self> {
        Ok(Self {
            id: InventoryUnitId::new(),
            material_id: material.id,
            location: normalize_location(location)?,
            quantity: 0,
            locked_quantity: 0,
            alert_threshold: material.alert_threshold,
            version: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn available(&self) -> i64 {
        self.quantity - self.locked_quantity
    }

    /// Whether on-hand stock has dropped below the unit's alert threshold.
    pub fn is_below_alert(&self) -> bool {
        self.quantity < self.alert_threshold
    }

    /// Add `qty` to on-hand stock (inbound, or the receiving side of a transfer).
    pub fn receive(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<StockMovement> {
        ensure_positive(qty)?;
        let quantity = self
            .quantity
            .checked_add(qty)
            .ok_or_else(|| DomainError::invariant("quantity overflow"))?;
        self.quantity = quantity;
        Ok(self.touch(qty, now))
    }

    /// Remove `qty` from unreserved stock (outbound, or the sending side of a transfer).
    pub fn issue(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<StockMovement> {
        ensure_positive(qty)?;
        self.ensure_available(qty)?;
        self.quantity -= qty;
        Ok(self.touch(-qty, now))
    }

    /// Reserve `qty` of unreserved stock for dispatch.
    pub fn reserve(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<StockMovement> {
        ensure_positive(qty)?;
        self.ensure_available(qty)?;
        self.locked_quantity += qty;
        Ok(self.touch(-qty, now))
    }

    /// Return `qty` of reserved stock to availability.
    pub fn release(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<StockMovement> {
        ensure_positive(qty)?;
        if qty > self.locked_quantity {
            return Err(DomainError::invariant(format!(
                "unit {}: cannot release {qty}, only {} locked",
                self.id, self.locked_quantity
            )));
        }
        self.locked_quantity -= qty;
        Ok(self.touch(qty, now))
    }

    fn ensure_available(&self, qty: i64) -> DomainResult<()> {
        if self.available() < qty {
            return Err(DomainError::insufficient_stock(format!(
                "unit {} at {}: requested {qty}, available {}",
                self.id,
                self.location,
                self.available()
            )));
        }
        Ok(())
    }

    fn touch(&mut self, delta: i64, now: DateTime<Utc>) -> StockMovement {
        self.version += 1;
        self.updated_at = now;
        StockMovement {
            delta,
            balance_after: self.quantity,
            available_after: self.available(),
        }
    }
}

/// Trim a location name and reject empty ones.
pub fn normalize_location(location: &str) -> DomainResult<String> {
    let location = location.trim();
    if location.is_empty() {
        return Err(DomainError::validation("location cannot be empty"));
    }
    Ok(location.to_string())
}

fn ensure_positive(qty: i64) -> DomainResult<()> {
    if qty <= 0 {
        return Err(DomainError::validation(format!(
            "quantity must be positive, got {qty}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::NewMaterial;

    fn unit_with(quantity: i64, locked: i64) -> InventoryUnit {
        let material = NewMaterial {
            name: "Water".to_string(),
            category: String::new(),
            unit: "litre".to_string(),
            batch_label: None,
            expiry_date: None,
            alert_threshold: Some(10),
        }
        .into_material(Utc::now())
        .unwrap();
        let mut unit = InventoryUnit::open(&material, "Depot-1", Utc::now()).unwrap();
        unit.quantity = quantity;
        unit.locked_quantity = locked;
        unit
    }

    #[test]
    fn reserve_draws_from_available_only() {
        let mut unit = unit_with(10, 6);
        let err = unit.reserve(5, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
        assert_eq!((unit.quantity, unit.locked_quantity), (10, 6));

        let m = unit.reserve(4, Utc::now()).unwrap();
        assert_eq!(m.delta, -4);
        assert_eq!(m.balance_after, 10);
        assert_eq!(m.available_after, 0);
        assert_eq!(unit.locked_quantity, 10);
    }

    #[test]
    fn issue_cannot_ship_reserved_stock() {
        let mut unit = unit_with(10, 8);
        assert!(unit.issue(3, Utc::now()).is_err());
        let m = unit.issue(2, Utc::now()).unwrap();
        assert_eq!(m.balance_after, 8);
        assert_eq!(unit.locked_quantity, 8);
    }

    #[test]
    fn release_more_than_locked_is_rejected() {
        let mut unit = unit_with(10, 2);
        assert!(matches!(
            unit.release(3, Utc::now()).unwrap_err(),
            DomainError::InvariantViolation(_)
        ));
        assert_eq!(unit.release(2, Utc::now()).unwrap().available_after, 10);
    }

    #[test]
    fn non_positive_quantities_are_validation_errors() {
        let mut unit = unit_with(10, 0);
        for qty in [0, -1] {
            assert!(matches!(unit.receive(qty, Utc::now()), Err(DomainError::Validation(_))));
            assert!(matches!(unit.issue(qty, Utc::now()), Err(DomainError::Validation(_))));
            assert!(matches!(unit.reserve(qty, Utc::now()), Err(DomainError::Validation(_))));
        }
        assert_eq!(unit.version, 0);
    }

    #[test]
    fn every_mutation_bumps_version() {
        let mut unit = unit_with(0, 0);
        unit.receive(5, Utc::now()).unwrap();
        unit.reserve(1, Utc::now()).unwrap();
        unit.release(1, Utc::now()).unwrap();
        unit.issue(5, Utc::now()).unwrap();
        assert_eq!(unit.version, 4);
        assert!(unit.is_below_alert());
    }
}
