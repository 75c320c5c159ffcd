//! HTTP control surface.
//!
//! Thin layer over the engines: every handler validates input, calls one
//! engine operation, and maps domain errors onto status codes. The retry
//! endpoint's refusals are part of the contract: 429 while the backoff window
//! is open, 503 while a circuit is open, 500 once the budget is spent.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{GafferError, Result};
use crate::executor::CheckpointExecutor;
use crate::governance::{DraftFilter, DraftGovernor, DraftState};
use crate::pool::WorkerPool;
use crate::retry::{BreakerRegistry, RetryEngine, RetryGate};
use crate::task::{Checkpoint, Task};
use crate::verify::CommandVerifier;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub executor: Arc<CheckpointExecutor>,
    pub verifier: Arc<CommandVerifier>,
    pub retries: Arc<RetryEngine>,
    pub breakers: Arc<BreakerRegistry>,
    pub governor: Arc<DraftGovernor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/checkpoints/execute-all", post(execute_all))
        .route("/retry", post(retry))
        .route("/drafts", post(drafts))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(bind_addr: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "control server listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| GafferError::Other(e.to_string()))
}

/// Domain error to HTTP status mapping.
struct ApiError(GafferError);

impl From<GafferError> for ApiError {
    fn from(err: GafferError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GafferError::DraftNotFound(_) | GafferError::WorkerNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GafferError::ActiveDraftExists { .. } => StatusCode::CONFLICT,
            GafferError::InvalidStateTransition { .. }
            | GafferError::DraftFrozen { .. }
            | GafferError::ApproverRequired
            | GafferError::UnknownOperation(_)
            | GafferError::Config(_)
            | GafferError::Json(_) => StatusCode::BAD_REQUEST,
            GafferError::RetryTooSoon { .. } => StatusCode::TOO_MANY_REQUESTS,
            GafferError::PoolSaturated { .. }
            | GafferError::CircuitOpen { .. }
            | GafferError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CheckpointSpec {
    name: String,
    objective: String,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    pass_criteria: Vec<String>,
    #[serde(default = "default_blocking")]
    blocking: bool,
}

fn default_blocking() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ExecuteAllRequest {
    title: String,
    #[serde(default)]
    objective: String,
    checkpoints: Vec<CheckpointSpec>,
}

async fn execute_all(
    State(state): State<AppState>,
    Json(req): Json<ExecuteAllRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    let checkpoints = req
        .checkpoints
        .into_iter()
        .map(|spec| {
            let mut cp = Checkpoint::new(spec.name, spec.objective)
                .with_instructions(spec.instructions)
                .with_pass_criteria(spec.pass_criteria);
            if !spec.blocking {
                cp = cp.non_blocking();
            }
            cp
        })
        .collect();
    let mut task = Task::new(req.title, req.objective).with_checkpoints(checkpoints);

    let lease = state.pool.acquire(&task.id).await?;
    let cancel = CancellationToken::new();
    let report = state
        .executor
        .execute_all(lease.channel(), &mut task, &cancel)
        .await?;
    drop(lease);

    Ok(Json(serde_json::to_value(report).map_err(GafferError::from)?))
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    action: String,
    #[serde(default)]
    unit_id: Option<String>,
    #[serde(default)]
    operation: Option<String>,
}

fn required<'a>(field: Option<&'a String>, name: &str) -> std::result::Result<&'a str, ApiError> {
    field
        .map(String::as_str)
        .ok_or_else(|| ApiError(GafferError::Config(format!("missing field: {}", name))))
}

async fn retry(
    State(state): State<AppState>,
    Json(req): Json<RetryRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    match req.action.as_str() {
        "retry" => {
            let unit_id = required(req.unit_id.as_ref(), "unit_id")?;
            let operation = required(req.operation.as_ref(), "operation")?;
            run_retry(&state, unit_id, operation).await
        }
        "status" => match (&req.unit_id, &req.operation) {
            (Some(unit_id), Some(operation)) => Ok(Json(json!({
                "state": state.retries.status(unit_id, operation),
            }))),
            _ => Ok(Json(json!({ "states": state.retries.all_states() }))),
        },
        "reset" => {
            let unit_id = required(req.unit_id.as_ref(), "unit_id")?;
            let operation = required(req.operation.as_ref(), "operation")?;
            let removed = state.retries.reset(unit_id, operation);
            Ok(Json(json!({ "reset": removed })))
        }
        "circuit-status" => Ok(Json(json!({ "circuits": state.breakers.snapshot() }))),
        other => Err(ApiError(GafferError::UnknownOperation(other.to_string()))),
    }
}

/// Admit one attempt through the gate and run the named maintenance
/// operation. The gate is consulted before anything executes, so a refused
/// attempt has no side effects.
async fn run_retry(
    state: &AppState,
    unit_id: &str,
    operation: &str,
) -> std::result::Result<Json<Value>, ApiError> {
    let attempt = match state.retries.gate_with_breaker(&state.breakers, unit_id, operation) {
        RetryGate::Proceed { attempt } => attempt,
        RetryGate::CircuitOpen { retry_after_secs } => {
            return Err(ApiError(GafferError::CircuitOpen {
                operation: operation.to_string(),
                retry_after_secs,
            }))
        }
        RetryGate::TooSoon { retry_after_secs } => {
            return Err(ApiError(GafferError::RetryTooSoon {
                unit_id: unit_id.to_string(),
                operation: operation.to_string(),
                retry_after_secs,
            }))
        }
        RetryGate::Exhausted { attempts, .. } => {
            return Err(ApiError(GafferError::RetryExhausted {
                unit_id: unit_id.to_string(),
                operation: operation.to_string(),
                attempts,
            }))
        }
    };

    let outcome = match operation {
        "worker-restart" => state.pool.restart(unit_id).await,
        "probe-backend" => state
            .pool
            .ensure_healthy(&state.verifier, unit_id)
            .await
            .map(|_| ()),
        other => {
            return Err(ApiError(GafferError::UnknownOperation(other.to_string())))
        }
    };

    match outcome {
        Ok(()) => {
            state.retries.record_success(unit_id, operation);
            state.breakers.record_success(operation);
            Ok(Json(json!({ "status": "succeeded", "attempt": attempt })))
        }
        Err(e) => {
            state.retries.record_failure(unit_id, operation, &e.to_string());
            state.breakers.record_failure(operation);
            if state.retries.should_retry(unit_id, operation) {
                Err(ApiError(GafferError::Backend(format!(
                    "attempt {} failed: {}",
                    attempt, e
                ))))
            } else {
                Err(ApiError(GafferError::RetryExhausted {
                    unit_id: unit_id.to_string(),
                    operation: operation.to_string(),
                    attempts: attempt,
                }))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DraftRequest {
    action: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    approver: Option<String>,
    #[serde(default)]
    task_count: Option<usize>,
    #[serde(default)]
    state: Option<DraftState>,
    #[serde(default)]
    created_after: Option<DateTime<Utc>>,
}

async fn drafts(
    State(state): State<AppState>,
    Json(req): Json<DraftRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    let governor: &DraftGovernor = &state.governor;
    let value = match req.action.as_str() {
        "create" => {
            let title = required(req.title.as_ref(), "title")?;
            let content = required(req.content.as_ref(), "content")?;
            let author = required(req.author.as_ref(), "author")?;
            serde_json::to_value(governor.create_draft(title, content, author)?)
        }
        "get" => {
            let id = required(req.id.as_ref(), "id")?;
            serde_json::to_value(governor.get(id)?)
        }
        "update" => {
            let id = required(req.id.as_ref(), "id")?;
            let content = required(req.content.as_ref(), "content")?;
            serde_json::to_value(governor.update_draft(id, content)?)
        }
        "validate" => {
            let id = required(req.id.as_ref(), "id")?;
            serde_json::to_value(governor.validate_draft(id)?)
        }
        "create-tasks" => {
            let id = required(req.id.as_ref(), "id")?;
            serde_json::to_value(governor.create_tasks(id, req.task_count.unwrap_or(1))?)
        }
        "merge" => {
            let id = required(req.id.as_ref(), "id")?;
            let approver = required(req.approver.as_ref(), "approver")?;
            serde_json::to_value(governor.merge_draft(id, approver)?)
        }
        "list" => serde_json::to_value(governor.list(&DraftFilter {
            state: req.state,
            created_after: req.created_after,
        })),
        "history" => {
            let id = required(req.id.as_ref(), "id")?;
            serde_json::to_value(governor.history(id)?)
        }
        other => return Err(ApiError(GafferError::UnknownOperation(other.to_string()))),
    };
    Ok(Json(value.map_err(GafferError::from)?))
}

/// Side-effect-free liveness view: pool occupancy plus circuit states.
async fn health(State(state): State<AppState>) -> std::result::Result<Json<Value>, ApiError> {
    let pool = state.pool.status();
    Ok(Json(json!({
        "status": "ok",
        "pool": { "total": pool.total, "busy": pool.busy, "idle": pool.idle },
        "circuits": state.breakers.snapshot(),
    })))
}

async fn status(State(state): State<AppState>) -> std::result::Result<Json<Value>, ApiError> {
    Ok(Json(json!({
        "pool": state.pool.status(),
        "retries": state.retries.all_states(),
        "circuits": state.breakers.snapshot(),
        "drafts": state.governor.list(&DraftFilter::default()),
    })))
}
