//! Dispatch's view of the stock service.
//!
//! `lock_stock` reports an explicit refusal as `Ok` with `success == false`.
//! An `Err` means the outcome is unknown: the lock may or may not have been
//! taken, and only a later `release_lock` under the same key settles it.

use std::sync::Arc;

use thiserror::Error;

use supplyline_core::{LockKey, MaterialId};
use supplyline_stock::{InventoryItemView, LockStockRequest, LockStockResponse, ReleaseLockResponse};

pub mod http;
pub mod local;

pub use http::HttpStockClient;
pub use local::LocalStockClient;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("stock service call timed out")]
    Timeout,

    #[error("stock service unreachable: {0}")]
    Transport(String),

    #[error("stock service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected stock service response: {0}")]
    Decode(String),
}

#[async_trait::async_trait]
pub trait StockClient: Send + Sync {
    async fn list_inventory_items(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryItemView>, RemoteError>;

    async fn lock_stock(&self, req: &LockStockRequest) -> Result<LockStockResponse, RemoteError>;

    async fn release_lock(&self, lock_key: LockKey) -> Result<ReleaseLockResponse, RemoteError>;
}

#[async_trait::async_trait]
impl<C> StockClient for Arc<C>
where
    C: StockClient + ?Sized,
{
    async fn list_inventory_items(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryItemView>, RemoteError> {
        (**self).list_inventory_items(material_id).await
    }

    async fn lock_stock(&self, req: &LockStockRequest) -> Result<LockStockResponse, RemoteError> {
        (**self).lock_stock(req).await
    }

    async fn release_lock(&self, lock_key: LockKey) -> Result<ReleaseLockResponse, RemoteError> {
        (**self).release_lock(lock_key).await
    }
}
