use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{DomainError, DomainResult, MaterialId};

/// Low-stock threshold applied when a material does not specify one.
pub const DEFAULT_ALERT_THRESHOLD: i64 = 10;

/// Catalogue entry for a kind of supply.
///
/// Batch label and expiry are tracked per material; every inventory unit of
/// the material shares them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub id: MaterialId,
    pub name: String,
    pub category: String,
    /// Unit of measure ("box", "litre", ...).
    pub unit: String,
    pub batch_label: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    /// Copied onto each inventory unit opened for this material.
    pub alert_threshold: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMaterial {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub batch_label: Option<String>,
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
    #[serde(default)]
    pub alert_threshold: Option<i64>,
}

impl NewMaterial {
    pub fn into_material(self, now: DateTime<Utc>) -> DomainResult<Material> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(DomainError::validation("material name cannot be empty"));
        }
        let alert_threshold = self.alert_threshold.unwrap_or(DEFAULT_ALERT_THRESHOLD);
        if alert_threshold < 0 {
            return Err(DomainError::validation("alert threshold cannot be negative"));
        }
        Ok(Material {
            id: MaterialId::new(),
            name,
            category: self.category,
            unit: self.unit,
            batch_label: self.batch_label.filter(|b| !b.trim().is_empty()),
            expiry_date: self.expiry_date,
            alert_threshold,
            created_at: now,
            updated_at: now,
        })
    }
}
