//! In-process client, for single-binary deployments and tests.

use std::sync::Arc;

use tracing::debug;

use supplyline_core::{LockKey, MaterialId};
use supplyline_events::EventBus;
use supplyline_stock::{
    InventoryItemView, LockStockRequest, LockStockResponse, LowStockAlert, ReleaseLockResponse,
};

use super::{RemoteError, StockClient};
use crate::services::stock::{AlertBus, LockOutcome, StockError, StockLedger};
use crate::stock_store::StockStore;
use crate::store::StoreError;

/// Calls a [`StockLedger`] directly, with the same refusal/failure split as
/// the HTTP contract.
pub struct LocalStockClient<S, B = AlertBus> {
    ledger: Arc<StockLedger<S, B>>,
}

impl<S, B> LocalStockClient<S, B> {
    pub fn new(ledger: Arc<StockLedger<S, B>>) -> Self {
        Self { ledger }
    }
}

impl<S, B> Clone for LocalStockClient<S, B> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
        }
    }
}

/// What the stock service would have answered over HTTP.
fn remote_error(err: StockError) -> RemoteError {
    let status = match &err {
        StockError::NotFound(_) => 404,
        StockError::Validation(_) => 400,
        StockError::Conflict(_) | StockError::Store(StoreError::LockTimeout(_)) => 409,
        StockError::InsufficientStock(_) => 422,
        StockError::Invariant(_) | StockError::Store(_) => 500,
    };
    if status >= 500 {
        RemoteError::Transport(err.to_string())
    } else {
        RemoteError::Status {
            status,
            message: err.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl<S, B> StockClient for LocalStockClient<S, B>
where
    S: StockStore + 'static,
    B: EventBus<LowStockAlert> + 'static,
{
    async fn list_inventory_items(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryItemView>, RemoteError> {
        self.ledger
            .list_inventory_items(material_id)
            .await
            .map_err(remote_error)
    }

    async fn lock_stock(&self, req: &LockStockRequest) -> Result<LockStockResponse, RemoteError> {
        match self.ledger.lock_stock(req).await {
            Ok(LockOutcome::Locked(_)) => Ok(LockStockResponse::locked()),
            Ok(LockOutcome::Replayed(_)) => {
                debug!(lock_key = %req.lock_key, "lock replay acknowledged");
                Ok(LockStockResponse::locked())
            }
            Err(err) if err.is_refusal() => Ok(LockStockResponse::refused(err.to_string())),
            Err(err) => Err(RemoteError::Transport(err.to_string())),
        }
    }

    async fn release_lock(&self, lock_key: LockKey) -> Result<ReleaseLockResponse, RemoteError> {
        let outcome = self
            .ledger
            .release_lock(lock_key)
            .await
            .map_err(remote_error)?;
        Ok(ReleaseLockResponse {
            released: true,
            message: outcome.message().to_string(),
        })
    }
}
