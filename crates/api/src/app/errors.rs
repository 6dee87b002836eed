use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use supplyline_core::DomainError;
use supplyline_infra::{DispatchError, StockError, StoreError};

pub fn stock_error_to_response(err: StockError) -> axum::response::Response {
    match err {
        StockError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StockError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        StockError::InsufficientStock(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "insufficient_stock", msg)
        }
        StockError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StockError::Invariant(msg) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "invariant_violation",
            msg,
        ),
        StockError::Store(e) => store_error_to_response(e),
    }
}

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        DispatchError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        DispatchError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        DispatchError::InvalidStateForAudit { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_state_for_audit", message)
        }
        DispatchError::RequestNotApproved { .. } => {
            json_error(StatusCode::CONFLICT, "request_not_approved", message)
        }
        DispatchError::InvalidTransition(msg) => {
            json_error(StatusCode::CONFLICT, "invalid_transition", msg)
        }
        DispatchError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DispatchError::Shortfall(shortfall) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": "insufficient_stock",
                "message": message,
                "missing": shortfall.missing,
                "partial": shortfall.partial,
            })),
        )
            .into_response(),
        DispatchError::StockLockFailed(msg) => {
            json_error(StatusCode::CONFLICT, "stock_lock_failed", msg)
        }
        DispatchError::RemoteUnavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "stock_service_unavailable", msg)
        }
        DispatchError::Store(e) => store_error_to_response(e),
    }
}

/// Lock timeouts are worth retrying, so they surface as conflicts. Anything
/// else from storage is a server fault.
fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::LockTimeout(msg) => json_error(StatusCode::CONFLICT, "lock_timeout", msg),
        other => {
            tracing::error!(error = %other, "storage failure");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                other.to_string(),
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a typed identifier from a path segment.
pub fn parse_id<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: FromStr<Err = DomainError>,
{
    raw.parse::<T>()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use supplyline_core::RequestId;
    use supplyline_dispatch::{AllocationPlan, RequestStatus, Shortfall};

    #[test]
    fn audit_guard_is_a_conflict() {
        let resp = dispatch_error_to_response(DispatchError::InvalidStateForAudit {
            request_id: RequestId::new(),
            status: RequestStatus::Approved,
        });
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn shortfall_is_unprocessable() {
        let resp = dispatch_error_to_response(DispatchError::Shortfall(Shortfall {
            partial: AllocationPlan::default(),
            missing: 5,
        }));
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn remote_failure_is_service_unavailable() {
        let resp = dispatch_error_to_response(DispatchError::RemoteUnavailable("timeout".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn lock_timeouts_are_conflicts_and_backend_faults_are_500() {
        let resp = stock_error_to_response(StockError::Store(StoreError::LockTimeout("u1".into())));
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = stock_error_to_response(StockError::Store(StoreError::Backend("down".into())));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_ids_are_rejected() {
        let err = parse_id::<RequestId>("nope").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
