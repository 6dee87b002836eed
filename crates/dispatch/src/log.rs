use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{DispatchLogId, RequestId};

use crate::request::{RequestStatus, StatusChange};

/// What caused a logged transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogAction {
    Create,
    StartAudit,
    Audit,
    CreateTask,
    Ship,
    Sign,
    Remove,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Create => "Create",
            LogAction::StartAudit => "StartAudit",
            LogAction::Audit => "Audit",
            LogAction::CreateTask => "CreateTask",
            LogAction::Ship => "Ship",
            LogAction::Sign => "Sign",
            LogAction::Remove => "Remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(LogAction::Create),
            "StartAudit" => Some(LogAction::StartAudit),
            "Audit" => Some(LogAction::Audit),
            "CreateTask" => Some(LogAction::CreateTask),
            "Ship" => Some(LogAction::Ship),
            "Sign" => Some(LogAction::Sign),
            "Remove" => Some(LogAction::Remove),
            _ => None,
        }
    }
}

/// Append-only audit trail entry, written in the same unit of work as the
/// status change it records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLog {
    pub id: DispatchLogId,
    pub request_id: RequestId,
    pub prev_status: Option<RequestStatus>,
    pub curr_status: RequestStatus,
    pub action: LogAction,
    pub operator: String,
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

impl DispatchLog {
    pub fn record(
        request_id: RequestId,
        change: StatusChange,
        action: LogAction,
        operator: &str,
        remark: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DispatchLogId::new(),
            request_id,
            prev_status: change.from,
            curr_status: change.to,
            action,
            operator: operator.to_string(),
            remark: remark.into(),
            created_at: now,
        }
    }

    /// Check that `history` (oldest first) is a gap-free chain starting at
    /// creation: each entry's `prev_status` is the previous entry's `curr_status`.
    pub fn is_contiguous(history: &[DispatchLog]) -> bool {
        let mut current: Option<RequestStatus> = None;
        for (idx, entry) in history.iter().enumerate() {
            if idx == 0 && entry.prev_status.is_some() {
                return false;
            }
            if idx > 0 && entry.prev_status != current {
                return false;
            }
            current = Some(entry.curr_status);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(from: Option<RequestStatus>, to: RequestStatus, action: LogAction) -> DispatchLog {
        DispatchLog::record(
            RequestId::new(),
            StatusChange { from, to },
            action,
            "op",
            "",
            Utc::now(),
        )
    }

    #[test]
    fn contiguous_history_is_recognised() {
        let history = vec![
            entry(None, RequestStatus::Pending, LogAction::Create),
            entry(Some(RequestStatus::Pending), RequestStatus::Approved, LogAction::Audit),
            entry(
                Some(RequestStatus::Approved),
                RequestStatus::Dispatching,
                LogAction::CreateTask,
            ),
        ];
        assert!(DispatchLog::is_contiguous(&history));
    }

    #[test]
    fn gap_is_detected() {
        let history = vec![
            entry(None, RequestStatus::Pending, LogAction::Create),
            entry(
                Some(RequestStatus::Approved),
                RequestStatus::Dispatching,
                LogAction::CreateTask,
            ),
        ];
        assert!(!DispatchLog::is_contiguous(&history));
    }
}
