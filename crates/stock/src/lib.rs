//! Stock domain: materials, per-location inventory units and the stock ledger.
//!
//! Pure business rules only. Every mutation of an [`InventoryUnit`] goes
//! through a method that enforces `0 <= locked_quantity <= quantity` and
//! returns the [`StockMovement`] that must be written to the ledger in the
//! same unit of work.

pub mod alert;
pub mod contract;
pub mod ledger;
pub mod lock;
pub mod material;
pub mod unit;

pub use alert::LowStockAlert;
pub use contract::{
    InventoryItemView, LockItem, LockStockRequest, LockStockResponse, ReleaseLockRequest,
    ReleaseLockResponse,
};
pub use ledger::{EntryContext, LedgerBalance, StockLogEntry, StockLogKind};
pub use lock::{LockLine, LockStatus, StockLock, normalize_lines};
pub use material::{DEFAULT_ALERT_THRESHOLD, Material, NewMaterial};
pub use unit::{InventoryUnit, StockMovement, normalize_location};
