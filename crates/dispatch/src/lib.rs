//! Dispatch domain: demand requests, their audit trail, dispatch tasks and
//! the FEFO allocation planner.
//!
//! Deterministic business rules only; persistence and the remote stock
//! contract are driven from `supplyline-infra`.

pub mod attempt;
pub mod log;
pub mod planner;
pub mod request;
pub mod task;

pub use attempt::{AllocationAttempt, AttemptStatus};
pub use log::{DispatchLog, LogAction};
pub use planner::{
    AllocationLine, AllocationPlan, PlanError, Shortfall, no_expiry_sentinel, plan_allocation,
};
pub use request::{
    AuditAction, DemandRequest, NewDemandRequest, RequestStatus, StatusChange, Urgency,
};
pub use task::{DispatchTask, LogisticsUpdate, TaskStatus};
