//! Application services: one per bounded side.
//!
//! [`stock::StockLedger`] owns inventory units and the stock ledger;
//! [`dispatch::DispatchOrchestrator`] owns demand requests and dispatch
//! tasks, and reaches stock only through a [`crate::remote::StockClient`].

pub mod dispatch;
pub mod stock;
