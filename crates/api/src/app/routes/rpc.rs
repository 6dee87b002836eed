//! Remote contract consumed by the dispatch service.
//!
//! `lock-stock` answers 200 for both outcomes a caller can act on: locked
//! (including replays) and refused. Any other status means the effect is
//! unknown to the caller.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::debug;

use supplyline_core::{LockKey, MaterialId};
use supplyline_infra::services::stock::LockOutcome;
use supplyline_stock::{LockStockRequest, LockStockResponse, ReleaseLockRequest, ReleaseLockResponse};

use crate::app::errors;
use crate::app::services::Ledger;

pub fn router() -> Router {
    Router::new()
        .route("/inventory-items/:material_id", get(inventory_items))
        .route("/lock-stock", post(lock_stock))
        .route("/release-lock", post(release_lock))
        .route("/locks/:lock_key", get(lock_status))
}

pub async fn inventory_items(
    Extension(ledger): Extension<Arc<Ledger>>,
    Path(material_id): Path<String>,
) -> axum::response::Response {
    let material_id: MaterialId = match errors::parse_id(&material_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match ledger.list_inventory_items(material_id).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn lock_stock(
    Extension(ledger): Extension<Arc<Ledger>>,
    Json(body): Json<LockStockRequest>,
) -> axum::response::Response {
    match ledger.lock_stock(&body).await {
        Ok(LockOutcome::Locked(_)) => Json(LockStockResponse::locked()).into_response(),
        Ok(LockOutcome::Replayed(_)) => {
            debug!(lock_key = %body.lock_key, "lock replay acknowledged");
            Json(LockStockResponse::locked()).into_response()
        }
        Err(e) if e.is_refusal() => Json(LockStockResponse::refused(e.to_string())).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

/// Idempotent. `released` is true for every settled outcome, including a
/// key that never locked anything (it is retired instead).
pub async fn release_lock(
    Extension(ledger): Extension<Arc<Ledger>>,
    Json(body): Json<ReleaseLockRequest>,
) -> axum::response::Response {
    match ledger.release_lock(body.lock_key).await {
        Ok(outcome) => Json(ReleaseLockResponse {
            released: true,
            message: outcome.message().to_string(),
        })
        .into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn lock_status(
    Extension(ledger): Extension<Arc<Ledger>>,
    Path(lock_key): Path<String>,
) -> axum::response::Response {
    let lock_key: LockKey = match errors::parse_id(&lock_key) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match ledger.lock_status(lock_key).await {
        Ok(Some(lock)) => Json(lock).into_response(),
        Ok(None) => errors::json_error(
            axum::http::StatusCode::NOT_FOUND,
            "not_found",
            format!("no lock under key {lock_key}"),
        ),
        Err(e) => errors::stock_error_to_response(e),
    }
}
