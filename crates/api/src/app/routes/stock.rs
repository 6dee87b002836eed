use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use supplyline_core::{InventoryUnitId, MaterialId};
use supplyline_stock::NewMaterial;

use crate::app::services::Ledger;
use crate::app::{dto, errors};
use crate::context::OperatorContext;

pub fn materials_router() -> Router {
    Router::new()
        .route("/", post(register_material).get(list_materials))
        .route("/:id", get(get_material))
}

pub fn movements_router() -> Router {
    Router::new()
        .route("/inbound", post(inbound))
        .route("/outbound", post(outbound))
        .route("/transfer", post(transfer))
}

pub fn inventory_router() -> Router {
    Router::new()
        .route("/units", get(list_units))
        .route("/units/:id", get(get_unit))
        .route("/units/:id/ledger", get(unit_ledger))
        .route("/units/:id/ledger/verify", get(verify_unit_ledger))
}

pub async fn register_material(
    Extension(ledger): Extension<Arc<Ledger>>,
    Json(body): Json<NewMaterial>,
) -> axum::response::Response {
    match ledger.register_material(body).await {
        Ok(material) => (StatusCode::CREATED, Json(material)).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn list_materials(
    Extension(ledger): Extension<Arc<Ledger>>,
    Query(q): Query<dto::PageQuery>,
) -> axum::response::Response {
    match ledger.list_materials(q.pagination()).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn get_material(
    Extension(ledger): Extension<Arc<Ledger>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: MaterialId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match ledger.get_material(id).await {
        Ok(material) => Json(material).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn inbound(
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<dto::InboundRequest>,
) -> axum::response::Response {
    match ledger.inbound(body.into_command(operator.operator())).await {
        Ok(change) => (StatusCode::CREATED, Json(change)).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn outbound(
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<dto::OutboundRequest>,
) -> axum::response::Response {
    match ledger.outbound(body.into_command(operator.operator())).await {
        Ok(change) => Json(change).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn transfer(
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<dto::TransferRequest>,
) -> axum::response::Response {
    match ledger.transfer(body.into_command(operator.operator())).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn list_units(
    Extension(ledger): Extension<Arc<Ledger>>,
    Query(q): Query<dto::PageQuery>,
) -> axum::response::Response {
    match ledger.list_units(q.pagination()).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn get_unit(
    Extension(ledger): Extension<Arc<Ledger>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: InventoryUnitId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match ledger.get_unit(id).await {
        Ok(unit) => Json(unit).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn unit_ledger(
    Extension(ledger): Extension<Arc<Ledger>>,
    Path(id): Path<String>,
    Query(q): Query<dto::PageQuery>,
) -> axum::response::Response {
    let id: InventoryUnitId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match ledger.unit_ledger(id, q.pagination()).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn verify_unit_ledger(
    Extension(ledger): Extension<Arc<Ledger>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: InventoryUnitId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match ledger.verify_unit_ledger(id).await {
        Ok(check) => Json(check).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}
