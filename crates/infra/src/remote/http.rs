//! JSON-over-HTTP client for the stock service's `/rpc` routes.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use supplyline_core::{LockKey, MaterialId};
use supplyline_stock::{
    InventoryItemView, LockStockRequest, LockStockResponse, ReleaseLockRequest,
    ReleaseLockResponse,
};

use super::{RemoteError, StockClient};

#[derive(Debug, Clone)]
pub struct HttpStockClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStockClient {
    /// `timeout` bounds every call end to end.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, RemoteError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transport(err.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        });
    }
    response.json::<T>().await.map_err(|e| {
        if e.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Decode(e.to_string())
        }
    })
}

#[async_trait::async_trait]
impl StockClient for HttpStockClient {
    #[instrument(skip(self), fields(material_id = %material_id), err)]
    async fn list_inventory_items(
        &self,
        material_id: MaterialId,
    ) -> Result<Vec<InventoryItemView>, RemoteError> {
        let response = self
            .client
            .get(self.url(&format!("/rpc/inventory-items/{material_id}")))
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    #[instrument(skip(self, req), fields(lock_key = %req.lock_key), err)]
    async fn lock_stock(&self, req: &LockStockRequest) -> Result<LockStockResponse, RemoteError> {
        let response: LockStockResponse = self.post("/rpc/lock-stock", req).await?;
        debug!(success = response.success, "lock-stock answered");
        Ok(response)
    }

    #[instrument(skip(self), fields(lock_key = %lock_key), err)]
    async fn release_lock(&self, lock_key: LockKey) -> Result<ReleaseLockResponse, RemoteError> {
        self.post("/rpc/release-lock", &ReleaseLockRequest { lock_key })
            .await
    }
}
