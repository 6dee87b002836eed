use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use supplyline_core::{RequestId, TaskId};
use supplyline_dispatch::{LogisticsUpdate, NewDemandRequest};

use crate::app::services::Orchestrator;
use crate::app::{dto, errors};
use crate::context::OperatorContext;

pub fn requests_router() -> Router {
    Router::new()
        .route("/", post(create_request).get(list_requests))
        .route("/:id", get(get_request).delete(remove_request))
        .route("/:id/review", post(start_audit))
        .route("/:id/audit", post(audit_request))
        .route("/:id/allocation", get(suggest_allocation))
        .route("/:id/tasks", post(create_task))
        .route("/:id/history", get(request_history))
        .route("/:id/attempts", get(request_attempts))
        .route("/:id/logistics", post(logistics_update))
}

pub fn tasks_router() -> Router {
    Router::new()
        .route("/", get(list_tasks))
        .route("/:id", get(get_task))
}

fn request_id(raw: &str) -> Result<RequestId, axum::response::Response> {
    errors::parse_id(raw)
}

pub async fn create_request(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<NewDemandRequest>,
) -> axum::response::Response {
    match orchestrator
        .create_demand_request(body, operator.operator())
        .await
    {
        Ok(request) => (StatusCode::CREATED, Json(request)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn list_requests(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Query(q): Query<dto::RequestListQuery>,
) -> axum::response::Response {
    let status = match q.status() {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator
        .list_demand_requests(status, q.pagination())
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_request(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator.get_demand_request(id).await {
        Ok(request) => Json(request).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn remove_request(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator
        .remove_demand_request(id, operator.operator())
        .await
    {
        Ok(request) => Json(request).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn start_audit(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator.start_audit(id, operator.operator()).await {
        Ok(request) => Json(request).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn audit_request(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::AuditRequest>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator
        .audit_demand_request(id, body.action, &body.remark, operator.operator())
        .await
    {
        Ok(request) => Json(request).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn suggest_allocation(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator.suggest_allocation(id).await {
        Ok(plan) => Json(serde_json::json!({
            "total": plan.total(),
            "lines": plan.lines,
        }))
        .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn create_task(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::CreateTaskRequest>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator
        .create_dispatch_task(id, body.allocations, operator.operator())
        .await
    {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn request_history(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator.request_history(id).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn request_attempts(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator.attempts_for_request(id).await {
        Ok(attempts) => Json(attempts).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn logistics_update(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
    Json(body): Json<LogisticsUpdate>,
) -> axum::response::Response {
    let id = match request_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator
        .apply_logistics_update(id, body, operator.operator())
        .await
    {
        Ok(task) => Json(task).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn list_tasks(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Query(q): Query<dto::PageQuery>,
) -> axum::response::Response {
    match orchestrator.list_dispatch_tasks(q.pagination()).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn get_task(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TaskId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match orchestrator.get_dispatch_task(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
