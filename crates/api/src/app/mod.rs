//! Axum applications for the stock service and the dispatch service.
//!
//! - `services.rs`: runtime wiring (stores, clients, background workers)
//! - `routes/`: handlers, one file per surface
//! - `dto.rs`: request bodies and query strings
//! - `errors.rs`: error to status mapping and the JSON error body

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::{Ledger, Orchestrator};

/// Router of the stock service.
pub fn build_stock_app(ledger: Arc<Ledger>) -> Router {
    let api = routes::stock_router()
        .layer(Extension(ledger))
        .layer(axum::middleware::from_fn(middleware::operator_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(api)
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(middleware::request_log)))
}

/// Router of the dispatch service.
pub fn build_dispatch_app(orchestrator: Arc<Orchestrator>) -> Router {
    let api = routes::dispatch_router()
        .layer(Extension(orchestrator))
        .layer(axum::middleware::from_fn(middleware::operator_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(api)
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(middleware::request_log)))
}
