use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{DomainError, DomainResult, MaterialId, RequestId};

/// Urgency tier. `L1` is the most urgent; informational only, it does not
/// influence allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Urgency {
    L1,
    L2,
    L3,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::L1 => "L1",
            Urgency::L2 => "L2",
            Urgency::L3 => "L3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "L1" => Some(Urgency::L1),
            "L2" => Some(Urgency::L2),
            "L3" => Some(Urgency::L3),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Urgency::L1 => 3,
            Urgency::L2 => 2,
            Urgency::L3 => 1,
        }
    }
}

impl PartialOrd for Urgency {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// `L1 > L2 > L3`.
impl Ord for Urgency {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Lifecycle of a demand request.
///
/// ```text
/// Pending -> Auditing -> Approved -> Dispatching -> Shipping -> Signed
///    |          |
///    +----------+-----> Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Auditing,
    Approved,
    Rejected,
    Dispatching,
    Shipping,
    Signed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Auditing => "Auditing",
            RequestStatus::Approved => "Approved",
            RequestStatus::Rejected => "Rejected",
            RequestStatus::Dispatching => "Dispatching",
            RequestStatus::Shipping => "Shipping",
            RequestStatus::Signed => "Signed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(RequestStatus::Pending),
            "Auditing" => Some(RequestStatus::Auditing),
            "Approved" => Some(RequestStatus::Approved),
            "Rejected" => Some(RequestStatus::Rejected),
            "Dispatching" => Some(RequestStatus::Dispatching),
            "Shipping" => Some(RequestStatus::Shipping),
            "Signed" => Some(RequestStatus::Signed),
            _ => None,
        }
    }

    /// Audit decisions are accepted only before a decision has been made.
    pub fn accepts_audit(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Auditing)
    }

    /// Requests can be withdrawn until stock has been committed to them.
    pub fn is_removable(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending | RequestStatus::Auditing | RequestStatus::Rejected
        )
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Approve,
    Reject,
}

impl AuditAction {
    fn target(&self) -> RequestStatus {
        match self {
            AuditAction::Approve => RequestStatus::Approved,
            AuditAction::Reject => RequestStatus::Rejected,
        }
    }
}

/// A status transition, as recorded in the dispatch log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// `None` for the creation of the request.
    pub from: Option<RequestStatus>,
    pub to: RequestStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandRequest {
    pub id: RequestId,
    pub material_id: MaterialId,
    pub quantity: i64,
    pub urgency: Urgency,
    pub target_area: String,
    pub description: String,
    pub status: RequestStatus,
    pub audit_remark: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDemandRequest {
    pub material_id: MaterialId,
    pub quantity: i64,
    pub urgency: Urgency,
    pub target_area: String,
    #[serde(default)]
    pub description: String,
}

impl NewDemandRequest {
    pub fn into_request(self, now: DateTime<Utc>) -> DomainResult<(DemandRequest, StatusChange)> {
        if self.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "requested quantity must be positive, got {}",
                self.quantity
            )));
        }
        let target_area = self.target_area.trim().to_string();
        if target_area.is_empty() {
            return Err(DomainError::validation("target area cannot be empty"));
        }
        let request = DemandRequest {
            id: RequestId::new(),
            material_id: self.material_id,
            quantity: self.quantity,
            urgency: self.urgency,
            target_area,
            description: self.description,
            status: RequestStatus::Pending,
            audit_remark: String::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let change = StatusChange {
            from: None,
            to: RequestStatus::Pending,
        };
        Ok((request, change))
    }
}

impl DemandRequest {
    pub fn is_removed(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Pending -> Auditing.
    pub fn start_audit(&mut self, now: DateTime<Utc>) -> DomainResult<StatusChange> {
        self.transition(RequestStatus::Pending, RequestStatus::Auditing, now)
    }

    /// Pending/Auditing -> Approved/Rejected.
    pub fn audit(
        &mut self,
        action: AuditAction,
        remark: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<StatusChange> {
        if !self.status.accepts_audit() {
            return Err(DomainError::invalid_transition(format!(
                "request {} cannot be audited in status {}",
                self.id, self.status
            )));
        }
        let change = self.move_to(action.target(), now);
        self.audit_remark = remark.to_string();
        Ok(change)
    }

    /// Approved -> Dispatching, once stock has been locked and a task created.
    pub fn begin_dispatch(&mut self, now: DateTime<Utc>) -> DomainResult<StatusChange> {
        self.transition(RequestStatus::Approved, RequestStatus::Dispatching, now)
    }

    /// Dispatching -> Shipping.
    pub fn mark_shipping(&mut self, now: DateTime<Utc>) -> DomainResult<StatusChange> {
        self.transition(RequestStatus::Dispatching, RequestStatus::Shipping, now)
    }

    /// Shipping -> Signed.
    pub fn mark_signed(&mut self, now: DateTime<Utc>) -> DomainResult<StatusChange> {
        self.transition(RequestStatus::Shipping, RequestStatus::Signed, now)
    }

    /// Soft removal. The status is kept; the change logged is a self-transition.
    pub fn remove(&mut self, now: DateTime<Utc>) -> DomainResult<StatusChange> {
        if self.is_removed() {
            return Err(DomainError::not_found(format!("demand request {}", self.id)));
        }
        if !self.status.is_removable() {
            return Err(DomainError::invalid_transition(format!(
                "request {} cannot be removed in status {}",
                self.id, self.status
            )));
        }
        self.deleted_at = Some(now);
        self.updated_at = now;
        Ok(StatusChange {
            from: Some(self.status),
            to: self.status,
        })
    }

    fn transition(
        &mut self,
        expected: RequestStatus,
        next: RequestStatus,
        now: DateTime<Utc>,
    ) -> DomainResult<StatusChange> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(format!(
                "request {}: {} -> {} requires status {}",
                self.id, self.status, next, expected
            )));
        }
        Ok(self.move_to(next, now))
    }

    fn move_to(&mut self, next: RequestStatus, now: DateTime<Utc>) -> StatusChange {
        let change = StatusChange {
            from: Some(self.status),
            to: next,
        };
        self.status = next;
        self.updated_at = now;
        change
    }
}
