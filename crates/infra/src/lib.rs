//! Infrastructure layer: stores, services, the remote stock contract,
//! background workers and configuration.

pub mod config;
pub mod dispatch_store;
pub mod outbox;
pub mod remote;
pub mod services;
pub mod stock_store;
pub mod store;
pub mod workers;

pub use config::{AppConfig, ConfigError, DispatchServiceConfig, StockServiceConfig};
pub use services::dispatch::{DispatchError, DispatchOrchestrator};
pub use services::stock::{StockError, StockLedger};
pub use store::StoreError;
