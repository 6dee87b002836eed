//! `supplyline-core`: shared domain building blocks.
//!
//! Identifiers, the domain error model and pagination. No IO lives here; both
//! the stock and dispatch domains build on top of these types.

pub mod error;
pub mod id;
pub mod page;

pub use error::{DomainError, DomainResult};
pub use id::{
    AttemptId, DispatchLogId, InventoryUnitId, LockKey, MaterialId, OutboxId, RequestId,
    StockLogId, TaskId,
};
pub use page::{Page, Pagination};
