//! API Endpoint Tests
//!
//! Tests for:
//! - Health endpoint
//! - Parameter updates and logic management
//! - Policy management routing
//! - Pool monitoring
//! - Direct submit

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use vd_common::{AssignmentTable, DispatchMode, OutputDescriptor, Packet, WorkItem};
use vd_config::{PolicyStage, WorkerPoolConfig};
use vd_policy::{InferenceClient, PolicyDeps, PolicyRegistry, PolicySpec, StoreFactory};
use vd_queue::{MemoryBroker, QueueConsumer};
use vd_runtime::{BrokerConnector, ConnectionCache, LogicError, NodeLogic, NodeRuntime, NodeSettings, StreamHub, WorkerPool};

use vd_api::{create_router, AppState};

/// Never called by these tests
struct UnusedModel;

#[async_trait]
impl InferenceClient for UnusedModel {
    async fn infer(&self, _model_id: &str, _prompt: &str) -> vd_policy::Result<String> {
        Ok(String::new())
    }
}

/// Echo logic that remembers the last parameters it was given
struct MockLogic {
    params: Mutex<Value>,
}

#[async_trait]
impl NodeLogic for MockLogic {
    async fn on_data(&self, item: WorkItem) -> Result<Option<Value>, LogicError> {
        Ok(Some(item.payload))
    }

    async fn on_update(&self, params: Value) -> Result<Value, LogicError> {
        if !params.is_object() {
            return Err(LogicError::Update("parameters must be an object".into()));
        }
        *self.params.lock() = params.clone();
        Ok(params)
    }

    async fn management(&self, action: &str, _data: Value) -> Result<Value, LogicError> {
        match action {
            "parameters" => Ok(self.params.lock().clone()),
            other => Err(LogicError::UnsupportedAction(other.to_string())),
        }
    }
}

struct TestApp {
    router: axum::Router,
    broker: Arc<MemoryBroker>,
    runtime: Arc<NodeRuntime>,
}

fn create_test_app(pool: Option<Arc<WorkerPool>>) -> TestApp {
    let broker = MemoryBroker::new();
    let deps = PolicyDeps {
        inference: Arc::new(UnusedModel),
        stores: Arc::new(StoreFactory::memory(Duration::from_secs(60))),
    };
    let policies = Arc::new(PolicyRegistry::with_builtins(deps));
    policies
        .bind("chat", PolicyStage::Pre, &PolicySpec::new("history-compactor"))
        .unwrap();

    let consumer: Arc<dyn QueueConsumer> = Arc::new(broker.consumer("q-api"));
    let cache = Arc::new(ConnectionCache::new(
        Arc::new(BrokerConnector::new(broker.clone())),
        1,
        Duration::from_millis(5),
    ));
    let logic = Arc::new(MockLogic {
        params: Mutex::new(json!({})),
    });
    let settings = NodeSettings::new("assistant", "node-api")
        .with_default_output(OutputDescriptor::new("broker", 6379, "q-sink", "sink"));

    let mut runtime = NodeRuntime::new(
        settings,
        consumer,
        logic,
        policies,
        Arc::new(AssignmentTable::new()),
        cache,
    );
    if let Some(pool) = pool {
        runtime = runtime.with_pool(pool);
    }
    let runtime = Arc::new(runtime);

    let router = create_router(AppState::new(runtime.clone(), Arc::new(StreamHub::new())));
    TestApp { router, broker, runtime }
}

async fn get_body_string(body: Body) -> String {
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn get_body_json(body: Body) -> Value {
    serde_json::from_str(&get_body_string(body).await).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// ============================================================================
// Health Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app(None);

    let response = app.router.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["nodeLabel"], "assistant");
    assert_eq!(body["nodeId"], "node-api");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_health_degraded_after_shutdown() {
    let app = create_test_app(None);
    app.runtime.shutdown().await;

    let response = app.router.oneshot(get("/health")).await.unwrap();
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body["status"], "DEGRADED");
}

// ============================================================================
// Parameter and Management Tests
// ============================================================================

#[tokio::test]
async fn test_set_parameters_then_read_back() {
    let app = create_test_app(None);

    let response = app
        .router
        .clone()
        .oneshot(post_json("/setParameters", json!({"temperature": 0.2})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["temperature"], 0.2);

    let response = app
        .router
        .oneshot(post_json("/mgmt", json!({"action": "parameters"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body["result"]["temperature"], 0.2);
}

#[tokio::test]
async fn test_set_parameters_rejected() {
    let app = create_test_app(None);

    let response = app
        .router
        .oneshot(post_json("/setParameters", json!([1, 2])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unsupported_management_action() {
    let app = create_test_app(None);

    let response = app
        .router
        .oneshot(post_json("/mgmt", json!({"action": "reboot"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body["error"], "BAD_REQUEST");
    assert!(body["message"].as_str().unwrap().contains("reboot"));
}

// ============================================================================
// Policy Management Tests
// ============================================================================

#[tokio::test]
async fn test_policy_management_reaches_bound_policy() {
    let app = create_test_app(None);

    let response = app
        .router
        .oneshot(post_json(
            "/policies/mgmt",
            json!({"subgraph": "chat", "stage": "pre", "action": "window", "data": {"sessionId": "chat::s1"}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body["result"]["sessionId"], "chat::s1");
    assert!(body["result"]["window"].is_null());
}

#[tokio::test]
async fn test_policy_management_unbound_stage() {
    let app = create_test_app(None);

    let response = app
        .router
        .oneshot(post_json(
            "/policies/mgmt",
            json!({"subgraph": "chat", "stage": "post", "action": "window", "data": {}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_policy_management_bad_request() {
    let app = create_test_app(None);

    let response = app
        .router
        .oneshot(post_json(
            "/policies/mgmt",
            json!({"subgraph": "chat", "stage": "pre", "action": "reset", "data": {}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Monitoring Tests
// ============================================================================

#[tokio::test]
async fn test_pool_stats_without_pool() {
    let app = create_test_app(None);

    let response = app.router.oneshot(get("/monitoring/pool")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pool_stats_with_pool() {
    let pool = Arc::new(
        WorkerPool::start(WorkerPoolConfig {
            enabled: true,
            mode: DispatchMode::Tasks,
            workers: 2,
            queue_capacity: 4,
            sticky: true,
            rate_limit_per_minute: Some(600),
            shutdown_timeout_ms: 500,
        })
        .unwrap(),
    );
    let app = create_test_app(Some(pool.clone()));

    let response = app.router.oneshot(get("/monitoring/pool")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body["workers"], 2);
    assert_eq!(body["queueCapacityPerWorker"], 4);
    assert_eq!(body["mode"], "tasks");
    assert_eq!(body["rateLimitPerMinute"], 600);

    pool.shutdown().await;
}

// ============================================================================
// Direct Submit Tests
// ============================================================================

#[tokio::test]
async fn test_submit_processes_packet() {
    let app = create_test_app(None);
    let packet = serde_json::to_value(Packet::new("s-1", 1, json!({"text": "hi"}))).unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/submit")
        .header("content-type", "application/json")
        .header("x-vdag-queue", "q-api")
        .body(Body::from(packet.to_string()))
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = get_body_json(response.into_body()).await;
    assert_eq!(body["accepted"], true);
    assert_eq!(body["sessionId"], "s-1");

    let delivered = app.broker.drain("q-sink").unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, json!({"text": "hi"}));
}

#[tokio::test]
async fn test_submit_rejected_when_stopped() {
    let app = create_test_app(None);
    app.runtime.shutdown().await;
    let packet = serde_json::to_value(Packet::new("s-2", 1, json!({}))).unwrap();

    let response = app
        .router
        .oneshot(post_json("/submit", packet))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(app.broker.is_empty("q-sink"));
}

#[tokio::test]
async fn test_openapi_document() {
    let app = create_test_app(None);

    let response = app.router.oneshot(get("/api-doc/openapi.json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = get_body_string(response.into_body()).await;
    assert!(body.contains("/policies/mgmt"));
    assert!(body.contains("vDAG Node API"));
}
