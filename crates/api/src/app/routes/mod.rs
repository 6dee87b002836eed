use axum::Router;

pub mod dispatch;
pub mod rpc;
pub mod stock;
pub mod system;

/// Public and remote-contract endpoints of the stock service.
pub fn stock_router() -> Router {
    Router::new()
        .nest("/materials", stock::materials_router())
        .nest("/stock", stock::movements_router())
        .nest("/inventory", stock::inventory_router())
        .nest("/rpc", rpc::router())
}

/// Endpoints of the dispatch service.
pub fn dispatch_router() -> Router {
    Router::new()
        .nest("/requests", dispatch::requests_router())
        .nest("/tasks", dispatch::tasks_router())
}
