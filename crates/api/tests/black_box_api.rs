use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};

use supplyline_api::app::services::{DispatchServices, SharedStockClient, StockServices};
use supplyline_api::app::{build_dispatch_app, build_stock_app};
use supplyline_infra::AppConfig;
use supplyline_infra::dispatch_store::InMemoryDispatchStore;
use supplyline_infra::outbox::LoggingNotifier;
use supplyline_infra::remote::HttpStockClient;
use supplyline_infra::stock_store::InMemoryStockStore;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(app: axum::Router) -> Self {
        // Same routers as prod, bound to an ephemeral port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Both services in-process, dispatch talking to stock over HTTP.
struct Stack {
    stock: TestServer,
    dispatch: TestServer,
    _stock_services: StockServices,
    _dispatch_services: DispatchServices,
}

impl Stack {
    async fn spawn() -> Self {
        let stock_services = StockServices::with_store(Arc::new(InMemoryStockStore::default()));
        let stock = TestServer::spawn(build_stock_app(stock_services.ledger.clone())).await;

        let (dispatch, dispatch_services) = spawn_dispatch(&stock.base_url).await;
        Self {
            stock,
            dispatch,
            _stock_services: stock_services,
            _dispatch_services: dispatch_services,
        }
    }
}

async fn spawn_dispatch(stock_url: &str) -> (TestServer, DispatchServices) {
    let config = AppConfig::from_lookup(|_| None).unwrap().dispatch;
    let client: SharedStockClient =
        Arc::new(HttpStockClient::new(stock_url, config.lock_call_timeout).unwrap());
    let services = DispatchServices::with_parts(
        Arc::new(InMemoryDispatchStore::default()),
        client,
        Arc::new(LoggingNotifier),
        &config,
    );
    let server = TestServer::spawn(build_dispatch_app(services.orchestrator.clone())).await;
    (server, services)
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> (StatusCode, Value) {
    let resp = client
        .post(url)
        .header("x-operator", "tester")
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

async fn get(client: &reqwest::Client, url: String) -> (StatusCode, Value) {
    let resp = client.get(url).send().await.unwrap();
    let status = resp.status();
    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

async fn register_material(client: &reqwest::Client, stock: &TestServer, name: &str) -> String {
    let (status, body) = post(
        client,
        stock.url("/materials"),
        json!({ "name": name, "category": "medical", "unit": "box", "alert_threshold": 2 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().to_string()
}

async fn receive(
    client: &reqwest::Client,
    stock: &TestServer,
    material_id: &str,
    location: &str,
    quantity: i64,
) -> String {
    let (status, body) = post(
        client,
        stock.url("/stock/inbound"),
        json!({ "material_id": material_id, "location": location, "quantity": quantity }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["unit"]["id"].as_str().unwrap().to_string()
}

/// Create, review and approve a request for `quantity`.
async fn approved_request(
    client: &reqwest::Client,
    dispatch: &TestServer,
    material_id: &str,
    quantity: i64,
) -> String {
    let (status, body) = post(
        client,
        dispatch.url("/requests"),
        json!({
            "material_id": material_id,
            "quantity": quantity,
            "urgency": "L1",
            "target_area": "North shelter",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "Pending");
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = post(client, dispatch.url(&format!("/requests/{id}/review")), json!({})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "Auditing");

    let (status, body) = post(
        client,
        dispatch.url(&format!("/requests/{id}/audit")),
        json!({ "action": "approve", "remark": "ok" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "Approved");
    id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_endpoints_respond() {
    let stack = Stack::spawn().await;
    let client = reqwest::Client::new();

    let (status, _) = get(&client, stack.stock.url("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(&client, stack.dispatch.url("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_to_signed_delivery_end_to_end() {
    let stack = Stack::spawn().await;
    let client = reqwest::Client::new();

    let material = register_material(&client, &stack.stock, "Saline 500ml").await;
    let u1 = receive(&client, &stack.stock, &material, "Depot A", 5).await;
    let u2 = receive(&client, &stack.stock, &material, "Depot B", 3).await;

    let id = approved_request(&client, &stack.dispatch, &material, 8).await;

    // A decision is final.
    let (status, body) = post(
        &client,
        stack.dispatch.url(&format!("/requests/{id}/audit")),
        json!({ "action": "reject" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_state_for_audit");

    let (status, plan) = get(&client, stack.dispatch.url(&format!("/requests/{id}/allocation"))).await;
    assert_eq!(status, StatusCode::OK, "{plan}");
    assert_eq!(plan["total"], 8);
    assert_eq!(plan["lines"].as_array().unwrap().len(), 2);

    // Over-asking one unit is refused by the stock service and leaves nothing behind.
    let (status, body) = post(
        &client,
        stack.dispatch.url(&format!("/requests/{id}/tasks")),
        json!({ "allocations": [{ "inventory_unit_id": u1, "quantity": 6 }] }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(body["error"], "stock_lock_failed");
    let (_, attempts) = get(&client, stack.dispatch.url(&format!("/requests/{id}/attempts"))).await;
    assert!(attempts.as_array().unwrap().is_empty());

    let (status, task) = post(
        &client,
        stack.dispatch.url(&format!("/requests/{id}/tasks")),
        json!({ "allocations": [
            { "inventory_unit_id": u1, "quantity": 5 },
            { "inventory_unit_id": u2, "quantity": 3 },
        ] }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{task}");
    assert_eq!(task["status"], "Created");
    let task_id = task["id"].as_str().unwrap().to_string();

    let (_, request) = get(&client, stack.dispatch.url(&format!("/requests/{id}"))).await;
    assert_eq!(request["status"], "Dispatching");

    let (_, unit) = get(&client, stack.stock.url(&format!("/inventory/units/{u1}"))).await;
    assert_eq!(unit["quantity"], 5);
    assert_eq!(unit["locked_quantity"], 5);
    let (_, unit) = get(&client, stack.stock.url(&format!("/inventory/units/{u2}"))).await;
    assert_eq!(unit["locked_quantity"], 3);

    // Locked stock is not available for outbound.
    let (status, body) = post(
        &client,
        stack.stock.url("/stock/outbound"),
        json!({ "material_id": material, "location": "Depot A", "quantity": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    assert_eq!(body["error"], "insufficient_stock");

    let (_, check) = get(&client, stack.stock.url(&format!("/inventory/units/{u1}/ledger/verify"))).await;
    assert_eq!(check["consistent"], true);
    assert_eq!(check["available"], 0);

    let (status, task) = post(
        &client,
        stack.dispatch.url(&format!("/requests/{id}/logistics")),
        json!({ "event": "shipped", "logistics_ref": "TRK-1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{task}");
    assert_eq!(task["status"], "InTransit");

    let (status, task) = post(
        &client,
        stack.dispatch.url(&format!("/requests/{id}/logistics")),
        json!({ "event": "delivered" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{task}");
    assert_eq!(task["status"], "Delivered");

    let (_, request) = get(&client, stack.dispatch.url(&format!("/requests/{id}"))).await;
    assert_eq!(request["status"], "Signed");

    let (status, fetched) = get(&client, stack.dispatch.url(&format!("/tasks/{task_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["request_id"], id.as_str());

    let (_, history) = get(&client, stack.dispatch.url(&format!("/requests/{id}/history"))).await;
    let actions: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["action"].as_str().unwrap())
        .collect();
    assert_eq!(
        actions,
        ["Create", "StartAudit", "Audit", "CreateTask", "Ship", "Sign"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shortfall_reports_missing_quantity() {
    let stack = Stack::spawn().await;
    let client = reqwest::Client::new();

    let material = register_material(&client, &stack.stock, "Water 5l").await;
    receive(&client, &stack.stock, &material, "Depot A", 10).await;
    receive(&client, &stack.stock, &material, "Depot B", 5).await;

    let id = approved_request(&client, &stack.dispatch, &material, 20).await;

    let (status, body) = get(&client, stack.dispatch.url(&format!("/requests/{id}/allocation"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    assert_eq!(body["error"], "insufficient_stock");
    assert_eq!(body["missing"], 5);
    assert_eq!(body["partial"]["lines"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_errors_map_to_statuses() {
    let stack = Stack::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = get(&client, stack.dispatch.url("/requests/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");

    let missing = supplyline_core::RequestId::new();
    let (status, body) = get(&client, stack.dispatch.url(&format!("/requests/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let material = register_material(&client, &stack.stock, "Blankets").await;
    let (status, body) = post(
        &client,
        stack.dispatch.url("/requests"),
        json!({ "material_id": material, "quantity": 0, "urgency": "L2", "target_area": "East" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = get(&client, stack.dispatch.url("/requests?status=Lost")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_status");

    // A pending request cannot get a task.
    let (status, body) = post(
        &client,
        stack.dispatch.url("/requests"),
        json!({ "material_id": material, "quantity": 2, "urgency": "L3", "target_area": "East" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();
    let (status, body) = post(
        &client,
        stack.dispatch.url(&format!("/requests/{id}/tasks")),
        json!({ "allocations": [{ "inventory_unit_id": supplyline_core::InventoryUnitId::new(), "quantity": 2 }] }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "request_not_approved");

    let (status, listed) = get(&client, stack.dispatch.url("/requests?status=Pending&limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);

    // Withdrawn requests disappear.
    let resp = client
        .delete(stack.dispatch.url(&format!("/requests/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let (status, _) = get(&client, stack.dispatch.url(&format!("/requests/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_contract_is_idempotent_and_release_retires_keys() {
    let stack = Stack::spawn().await;
    let client = reqwest::Client::new();

    let material = register_material(&client, &stack.stock, "Tents").await;
    let unit = receive(&client, &stack.stock, &material, "Depot A", 4).await;

    let request_id = supplyline_core::RequestId::new();
    let lock_key = supplyline_core::LockKey::new();
    let lock = json!({
        "request_id": request_id,
        "lock_key": lock_key,
        "items": [{ "inventory_unit_id": unit, "quantity": 3 }],
    });

    let (status, body) = post(&client, stack.stock.url("/rpc/lock-stock"), lock.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let (status, body) = post(&client, stack.stock.url("/rpc/lock-stock"), lock.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, items) = get(&client, stack.stock.url(&format!("/rpc/inventory-items/{material}"))).await;
    assert_eq!(items[0]["locked_quantity"], 3);

    // Refusal is a 200 with success = false.
    let other = json!({
        "request_id": request_id,
        "lock_key": supplyline_core::LockKey::new(),
        "items": [{ "inventory_unit_id": unit, "quantity": 2 }],
    });
    let (status, body) = post(&client, stack.stock.url("/rpc/lock-stock"), other).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);

    let (status, body) = post(
        &client,
        stack.stock.url("/rpc/release-lock"),
        json!({ "lock_key": lock_key }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], true);
    let (_, items) = get(&client, stack.stock.url(&format!("/rpc/inventory-items/{material}"))).await;
    assert_eq!(items[0]["locked_quantity"], 0);

    // A key released before it ever locked refuses the late lock.
    let early = supplyline_core::LockKey::new();
    let (status, _) = post(&client, stack.stock.url("/rpc/release-lock"), json!({ "lock_key": early })).await;
    assert_eq!(status, StatusCode::OK);
    let late = json!({
        "request_id": request_id,
        "lock_key": early,
        "items": [{ "inventory_unit_id": unit, "quantity": 1 }],
    });
    let (status, body) = post(&client, stack.stock.url("/rpc/lock-stock"), late).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_stock_service_is_503_and_blocks_retries() {
    // Nothing listens on the discard port.
    let (dispatch, _services) = spawn_dispatch("http://127.0.0.1:9").await;
    let client = reqwest::Client::new();

    let material = supplyline_core::MaterialId::new().to_string();
    let id = approved_request(&client, &dispatch, &material, 1).await;
    let allocations = json!({ "allocations": [{ "inventory_unit_id": supplyline_core::InventoryUnitId::new(), "quantity": 1 }] });

    let (status, body) = post(&client, dispatch.url(&format!("/requests/{id}/tasks")), allocations.clone()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{body}");
    assert_eq!(body["error"], "stock_service_unavailable");

    // The in-doubt attempt is kept until the reconciler settles it.
    let (_, attempts) = get(&client, dispatch.url(&format!("/requests/{id}/attempts"))).await;
    assert_eq!(attempts.as_array().unwrap().len(), 1);
    let (status, body) = post(&client, dispatch.url(&format!("/requests/{id}/tasks")), allocations).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(body["error"], "conflict");
}
