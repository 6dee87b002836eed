//! Storage plumbing shared by the stock and dispatch stores.
//!
//! Both stores expose a unit-of-work API: `begin()` returns a transaction
//! whose `*_for_update` reads take exclusive row locks, writes are staged
//! until `commit()`, and dropping the transaction rolls it back.

pub mod pg;
pub mod row_lock;

pub use row_lock::RowLocks;

/// Storage-level failure. Any of these aborts the unit of work it happened in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A row lock could not be acquired within the configured timeout.
    #[error("row lock timeout: {0}")]
    LockTimeout(String),
    /// A uniqueness, foreign-key or check constraint rejected a write.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// A persisted row could not be mapped back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// Connection, pool or driver failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}
