use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use gaffer::backend::MockChannelFactory;
use gaffer::config::{BreakerConfig, ExecutorConfig, PoolConfig, RetryConfig, ValidationConfig};
use gaffer::executor::CheckpointExecutor;
use gaffer::governance::DraftGovernor;
use gaffer::pool::WorkerPool;
use gaffer::retry::{BreakerRegistry, RetryEngine};
use gaffer::server::{router, AppState};
use gaffer::verify::CommandVerifier;

async fn test_state() -> (AppState, Arc<MockChannelFactory>) {
    let factory = Arc::new(MockChannelFactory::new(2));
    let pool = Arc::new(WorkerPool::new(
        PoolConfig {
            size: 2,
            acquire_timeout_ms: 100,
        },
        factory.clone(),
    ));
    pool.initialize().await.unwrap();

    let executor_config = ExecutorConfig {
        checkpoint_retry_limit: 1,
        resolver_retry_limit: 1,
        retry_delay_ms: 1,
        test_timeout_ms: 1000,
        execute_timeout_ms: 1000,
    };
    let state = AppState {
        pool,
        executor: Arc::new(CheckpointExecutor::new(
            executor_config,
            CommandVerifier::new().with_settle(Duration::from_millis(1)),
        )),
        verifier: Arc::new(CommandVerifier::new()),
        retries: Arc::new(RetryEngine::new(RetryConfig {
            max_retries: 2,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
        })),
        breakers: Arc::new(BreakerRegistry::new(BreakerConfig {
            max_failures: 3,
            reset_timeout_secs: 300,
        })),
        governor: Arc::new(DraftGovernor::new(ValidationConfig {
            required_sections: vec!["## Task:".to_string()],
        })),
    };
    (state, factory)
}

async fn post_json(state: &AppState, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = router(state.clone())
        .oneshot(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let response = router(state.clone())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_execute_all_returns_run_report() {
    let (state, factory) = test_state().await;
    // Worker 0 is leased first; script a clean single-checkpoint pass.
    let channel = factory.channel(0);
    channel.push_response("work done");
    channel.push_response("TEST_PASS: verified");

    let (status, body) = post_json(
        &state,
        "/checkpoints/execute-all",
        json!({
            "title": "demo",
            "checkpoints": [{
                "name": "setup",
                "objective": "create the files",
                "pass_criteria": ["files exist"]
            }]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["passed"], json!(1));
    // The lease was returned.
    assert_eq!(state.pool.status().busy, 0);
}

#[tokio::test]
async fn test_retry_endpoint_gates_and_backs_off() {
    let (state, _) = test_state().await;

    let (status, body) = post_json(
        &state,
        "/retry",
        json!({ "action": "retry", "unit_id": "worker-0", "operation": "worker-restart" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("succeeded"));

    // Immediately again: the backoff window is still open.
    let (status, _) = post_json(
        &state,
        "/retry",
        json!({ "action": "retry", "unit_id": "worker-0", "operation": "worker-restart" }),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_retry_open_circuit_is_service_unavailable() {
    let (state, _) = test_state().await;
    for _ in 0..3 {
        state.breakers.record_failure("worker-restart");
    }

    let (status, body) = post_json(
        &state,
        "/retry",
        json!({ "action": "retry", "unit_id": "worker-0", "operation": "worker-restart" }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("Circuit open"));
    // The refused attempt was not counted against the unit's budget.
    assert!(state.retries.status("worker-0", "worker-restart").is_none());
}

#[tokio::test]
async fn test_retry_unknown_action_rejected() {
    let (state, _) = test_state().await;
    let (status, _) = post_json(&state, "/retry", json!({ "action": "explode" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_retry_circuit_status_lists_circuits() {
    let (state, _) = test_state().await;
    state.breakers.record_failure("probe-backend");

    let (status, body) = post_json(&state, "/retry", json!({ "action": "circuit-status" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["circuits"][0]["operation"], json!("probe-backend"));
}

#[tokio::test]
async fn test_draft_lifecycle_over_http() {
    let (state, _) = test_state().await;

    let (status, draft) = post_json(
        &state,
        "/drafts",
        json!({
            "action": "create",
            "title": "policy",
            "content": "## Task:\nAgents must write tests.",
            "author": "alex"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = draft["id"].as_str().unwrap().to_string();

    // A second active draft is a conflict.
    let (status, _) = post_json(
        &state,
        "/drafts",
        json!({ "action": "create", "title": "other", "content": "x", "author": "alex" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, draft) = post_json(&state, "/drafts", json!({ "action": "validate", "id": id })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(draft["state"], json!("validated"));

    let (status, _) = post_json(
        &state,
        "/drafts",
        json!({ "action": "create-tasks", "id": id, "task_count": 2 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Merge without an approver is refused.
    let (status, _) = post_json(
        &state,
        "/drafts",
        json!({ "action": "merge", "id": id, "approver": "  " }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, draft) = post_json(
        &state,
        "/drafts",
        json!({ "action": "merge", "id": id, "approver": "sam" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(draft["state"], json!("merged"));
    assert_eq!(draft["merged_by"], json!("sam"));
}

#[tokio::test]
async fn test_draft_not_found_is_404() {
    let (state, _) = test_state().await;
    let (status, _) = post_json(
        &state,
        "/drafts",
        json!({ "action": "get", "id": "draft_missing" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_reports_pool_and_circuits() {
    let (state, _) = test_state().await;
    let (status, body) = get_json(&state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["pool"]["total"], json!(2));
    assert_eq!(body["pool"]["idle"], json!(2));
}

#[tokio::test]
async fn test_status_reports_all_engines() {
    let (state, _) = test_state().await;
    let (status, body) = get_json(&state, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["pool"]["workers"].is_array());
    assert!(body["retries"].is_array());
    assert!(body["drafts"].is_array());
}
