use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{DomainError, DomainResult, RequestId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    InTransit,
    Delivered,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "Created",
            TaskStatus::InTransit => "InTransit",
            TaskStatus::Delivered => "Delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Created" => Some(TaskStatus::Created),
            "InTransit" => Some(TaskStatus::InTransit),
            "Delivered" => Some(TaskStatus::Delivered),
            _ => None,
        }
    }
}

/// Progress reported by the logistics collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogisticsUpdate {
    Shipped {
        #[serde(default)]
        logistics_ref: Option<String>,
    },
    Delivered,
}

/// The single dispatch task created for an approved request once its stock
/// has been locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub id: TaskId,
    pub request_id: RequestId,
    pub status: TaskStatus,
    pub operator: String,
    pub logistics_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchTask {
    pub fn create(request_id: RequestId, operator: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            request_id,
            status: TaskStatus::Created,
            operator: operator.to_string(),
            logistics_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, update: &LogisticsUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        match (self.status, update) {
            (TaskStatus::Created, LogisticsUpdate::Shipped { logistics_ref }) => {
                self.status = TaskStatus::InTransit;
                if logistics_ref.is_some() {
                    self.logistics_ref = logistics_ref.clone();
                }
            }
            (TaskStatus::InTransit, LogisticsUpdate::Delivered) => {
                self.status = TaskStatus::Delivered;
            }
            (status, update) => {
                return Err(DomainError::invalid_transition(format!(
                    "task {} in status {} cannot accept {update:?}",
                    self.id,
                    status.as_str()
                )));
            }
        }
        self.updated_at = now;
        Ok(())
    }
}
