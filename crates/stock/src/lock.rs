//! Reservation records kept by the stock side, keyed by the caller's lock key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{DomainError, DomainResult, InventoryUnitId, LockKey, RequestId};

use crate::contract::LockItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockLine {
    pub unit_id: InventoryUnitId,
    pub quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Held,
    Released,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Held => "held",
            LockStatus::Released => "released",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "held" => Some(LockStatus::Held),
            "released" => Some(LockStatus::Released),
            _ => None,
        }
    }
}

/// Outcome of one successful `lockStock` call.
///
/// A key released before any lock arrived is stored as a tombstone (no
/// request, no lines) so that a late lock call under that key is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLock {
    pub key: LockKey,
    pub request_id: Option<RequestId>,
    pub lines: Vec<LockLine>,
    pub status: LockStatus,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl StockLock {
    pub fn held(
        key: LockKey,
        request_id: RequestId,
        lines: Vec<LockLine>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            request_id: Some(request_id),
            lines,
            status: LockStatus::Held,
            created_at: now,
            released_at: None,
        }
    }

    pub fn tombstone(key: LockKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            request_id: None,
            lines: Vec::new(),
            status: LockStatus::Released,
            created_at: now,
            released_at: Some(now),
        }
    }

    /// Whether a new call is a replay of the one that created this lock.
    /// `lines` must already be normalized.
    pub fn is_replay_of(&self, request_id: RequestId, lines: &[LockLine]) -> bool {
        self.status == LockStatus::Held
            && self.request_id == Some(request_id)
            && self.lines == lines
    }

    pub fn mark_released(&mut self, now: DateTime<Utc>) {
        self.status = LockStatus::Released;
        self.released_at = Some(now);
    }
}

/// Validate lock items and fold them into lines sorted by unit id.
///
/// Duplicate units are merged by summing. The sort order is the order row
/// locks are taken in, which keeps concurrent lock calls deadlock-free.
pub fn normalize_lines(items: &[LockItem]) -> DomainResult<Vec<LockLine>> {
    if items.is_empty() {
        return Err(DomainError::validation("lock request has no items"));
    }
    let mut merged: BTreeMap<InventoryUnitId, i64> = BTreeMap::new();
    for item in items {
        if item.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "unit {}: quantity must be positive, got {}",
                item.inventory_unit_id, item.quantity
            )));
        }
        let total = merged.entry(item.inventory_unit_id).or_insert(0);
        *total = total
            .checked_add(item.quantity)
            .ok_or_else(|| DomainError::validation("lock quantity overflow"))?;
    }
    Ok(merged
        .into_iter()
        .map(|(unit_id, quantity)| LockLine { unit_id, quantity })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(unit_id: InventoryUnitId, quantity: i64) -> LockItem {
        LockItem {
            inventory_unit_id: unit_id,
            quantity,
        }
    }

    #[test]
    fn duplicates_are_merged_and_sorted() {
        let a = InventoryUnitId::new();
        let b = InventoryUnitId::new();
        let lines = normalize_lines(&[item(b, 2), item(a, 1), item(b, 3)]).unwrap();
        assert_eq!(
            lines,
            vec![
                LockLine { unit_id: a, quantity: 1 },
                LockLine { unit_id: b, quantity: 5 },
            ]
        );
    }

    #[test]
    fn empty_and_non_positive_items_are_rejected() {
        assert!(normalize_lines(&[]).is_err());
        assert!(normalize_lines(&[item(InventoryUnitId::new(), 0)]).is_err());
    }

    #[test]
    fn tombstone_is_never_a_replay() {
        let key = LockKey::new();
        let lock = StockLock::tombstone(key, Utc::now());
        assert!(!lock.is_replay_of(RequestId::new(), &[]));
        assert_eq!(lock.status, LockStatus::Released);
    }

    #[test]
    fn replay_requires_same_request_and_lines() {
        let unit = InventoryUnitId::new();
        let request = RequestId::new();
        let lines = vec![LockLine { unit_id: unit, quantity: 4 }];
        let lock = StockLock::held(LockKey::new(), request, lines.clone(), Utc::now());

        assert!(lock.is_replay_of(request, &lines));
        assert!(!lock.is_replay_of(RequestId::new(), &lines));
        assert!(!lock.is_replay_of(request, &[LockLine { unit_id: unit, quantity: 5 }]));
    }
}
