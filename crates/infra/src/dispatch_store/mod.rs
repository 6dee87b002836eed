//! Persistence for the dispatch side: demand requests, tasks, the dispatch
//! log, allocation attempts and the logistics outbox.

pub mod in_memory;
pub mod postgres;
mod r#trait;

pub use in_memory::InMemoryDispatchStore;
pub use postgres::PostgresDispatchStore;
pub use r#trait::{DispatchStore, DispatchTx};

pub const SCHEMA: &str = include_str!("../schema/dispatch.sql");
