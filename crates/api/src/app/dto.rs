use axum::http::StatusCode;
use serde::Deserialize;

use supplyline_core::{MaterialId, Pagination};
use supplyline_dispatch::{AuditAction, RequestStatus};
use supplyline_infra::services::stock::{InboundCommand, OutboundCommand, TransferCommand};
use supplyline_stock::LockItem;

use crate::app::errors;

// -------------------------
// Query strings
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PageQuery {
    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestListQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl RequestListQuery {
    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }

    pub fn status(&self) -> Result<Option<RequestStatus>, axum::response::Response> {
        match self.status.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => RequestStatus::parse(s).map(Some).ok_or_else(|| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_status",
                    format!("unknown request status `{s}`"),
                )
            }),
        }
    }
}

// -------------------------
// Stock service bodies
// -------------------------

#[derive(Debug, Deserialize)]
pub struct InboundRequest {
    pub material_id: MaterialId,
    pub location: String,
    pub quantity: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub related_order: Option<String>,
}

impl InboundRequest {
    pub fn into_command(self, operator: &str) -> InboundCommand {
        InboundCommand {
            material_id: self.material_id,
            location: self.location,
            quantity: self.quantity,
            operator: operator.to_string(),
            remark: self.remark,
            related_order: self.related_order,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OutboundRequest {
    pub material_id: MaterialId,
    pub location: String,
    pub quantity: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub related_order: Option<String>,
}

impl OutboundRequest {
    pub fn into_command(self, operator: &str) -> OutboundCommand {
        OutboundCommand {
            material_id: self.material_id,
            location: self.location,
            quantity: self.quantity,
            operator: operator.to_string(),
            remark: self.remark,
            related_order: self.related_order,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub material_id: MaterialId,
    pub from_location: String,
    pub to_location: String,
    pub quantity: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub related_order: Option<String>,
}

impl TransferRequest {
    pub fn into_command(self, operator: &str) -> TransferCommand {
        TransferCommand {
            material_id: self.material_id,
            from_location: self.from_location,
            to_location: self.to_location,
            quantity: self.quantity,
            operator: operator.to_string(),
            remark: self.remark,
            related_order: self.related_order,
        }
    }
}

// -------------------------
// Dispatch service bodies
// -------------------------

#[derive(Debug, Deserialize)]
pub struct AuditRequest {
    pub action: AuditAction,
    #[serde(default)]
    pub remark: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub allocations: Vec<LockItem>,
}
