//! Persistence for the stock side: materials, inventory units, the stock
//! ledger and lock records.

pub mod in_memory;
pub mod postgres;
mod r#trait;

pub use in_memory::InMemoryStockStore;
pub use postgres::PostgresStockStore;
pub use r#trait::{StockStore, StockTx};

/// Schema applied by [`PostgresStockStore::ensure_schema`].
pub const SCHEMA: &str = include_str!("../schema/stock.sql");
