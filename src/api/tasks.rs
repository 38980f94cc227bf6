use std::str::FromStr;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use phasegate_common::DepthTier;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{ApiError, SharedState};
use crate::breaker::CircuitState;
use crate::store::{TaskInput, TaskStatus};

const MAX_PROJECT_NAME: usize = 200;
const MIN_DESCRIPTION: usize = 10;
const MAX_DESCRIPTION: usize = 5_000;
const MIN_TOKEN_BUDGET: i64 = 5_000;
const MAX_TOKEN_BUDGET: i64 = 100_000;
const MAX_EMERGENCY_TOKENS: i64 = 100_000;
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/analyze", post(analyze))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{task_id}/status", get(task_status))
        .route("/tasks/{task_id}/results", get(task_results))
        .route("/tasks/{task_id}/budget", get(task_budget))
        .route("/tasks/{task_id}/budget/emergency", post(emergency_budget))
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub project_name: String,
    pub description: String,
    #[serde(default)]
    pub analysis_depth: Option<String>,
    #[serde(default)]
    pub token_budget: Option<i64>,
}

impl AnalyzeRequest {
    /// Check bounds and build the stored task input.
    pub fn validate(self) -> Result<TaskInput, String> {
        let name_len = self.project_name.trim().chars().count();
        if name_len == 0 || name_len > MAX_PROJECT_NAME {
            return Err(format!(
                "project_name must be 1-{} characters",
                MAX_PROJECT_NAME
            ));
        }
        let desc_len = self.description.trim().chars().count();
        if !(MIN_DESCRIPTION..=MAX_DESCRIPTION).contains(&desc_len) {
            return Err(format!(
                "description must be {}-{} characters",
                MIN_DESCRIPTION, MAX_DESCRIPTION
            ));
        }
        let depth = match self.analysis_depth.as_deref() {
            Some(raw) => DepthTier::from_str(raw)?,
            None => DepthTier::default(),
        };
        if let Some(budget) = self.token_budget
            && !(MIN_TOKEN_BUDGET..=MAX_TOKEN_BUDGET).contains(&budget)
        {
            return Err(format!(
                "token_budget must be between {} and {}",
                MIN_TOKEN_BUDGET, MAX_TOKEN_BUDGET
            ));
        }
        Ok(
            TaskInput::new(self.project_name.trim(), self.description.trim(), depth)
                .with_token_budget(self.token_budget),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct EmergencyBudgetRequest {
    pub additional_tokens: i64,
    pub justification: String,
}

// ── Helpers ───────────────────────────────────────────────────────────

fn estimated_minutes(depth: DepthTier) -> i64 {
    match depth {
        DepthTier::Quick => 5,
        DepthTier::Standard => 10,
        DepthTier::Comprehensive => 20,
    }
}

/// What a client should do next for a task in `status`.
pub fn next_action(status: TaskStatus, pending_approvals: usize) -> &'static str {
    if status == TaskStatus::AwaitingApproval || pending_approvals > 0 {
        return "human_approval_required";
    }
    match status {
        TaskStatus::Completed => "download_results",
        TaskStatus::Failed | TaskStatus::Expired => "review_error",
        TaskStatus::Running | TaskStatus::Approved => "wait_for_completion",
        _ => "wait",
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn service_info() -> impl IntoResponse {
    Json(json!({
        "service": "phasegate",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Phase-gated workflow orchestration with human approval, token budgets and circuit breakers",
        "endpoints": {
            "analyze": "POST /analyze",
            "list_tasks": "GET /tasks",
            "task_status": "GET /tasks/{task_id}/status",
            "task_results": "GET /tasks/{task_id}/results",
            "task_budget": "GET /tasks/{task_id}/budget",
            "emergency_budget": "POST /tasks/{task_id}/budget/emergency",
            "approval_request": "POST /approval/request",
            "pending_approvals": "GET /approval/pending/{task_id}",
            "respond": "POST /approval/respond/{approval_id}",
            "approval_status": "GET /approval/status/{task_id}",
            "expire": "DELETE /approval/expire/{approval_id}",
            "approval_health": "GET /approval/health",
            "breakers": "GET /breakers",
            "health": "GET /health",
        }
    }))
}

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let database_ok = state.store.ping().await.is_ok();
    let breakers = state.breakers.all_status().await.unwrap_or_default();
    let open_circuits: Vec<&String> = breakers
        .iter()
        .filter(|(_, s)| s.state == CircuitState::Open)
        .map(|(name, _)| name)
        .collect();

    let (code, status) = if !database_ok {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if !open_circuits.is_empty() {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        code,
        Json(json!({
            "status": status,
            "database": if database_ok { "connected" } else { "disconnected" },
            "circuit_breakers": breakers,
            "open_circuits": open_circuits,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
            "timestamp": Utc::now(),
        })),
    )
}

async fn analyze(
    State(state): State<SharedState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let input = req.validate().map_err(ApiError::BadRequest)?;
    let depth = input.analysis_depth;
    let task_id = uuid::Uuid::new_v4().to_string();
    let ttl = state.orchestrator.settings().task_ttl;

    state.store.enqueue(&task_id, input, ttl).await?;
    state.orchestrator.spawn_execute(task_id.clone());
    info!(task_id = %task_id, depth = %depth, "Analysis accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": task_id,
            "status": "started",
            "estimated_completion": Utc::now() + chrono::Duration::minutes(estimated_minutes(depth)),
            "approval_required": true,
            "approval_url": format!("/approval/pending/{}", task_id),
            "message": "Analysis started. Human approval will be required after research phase.",
        })),
    ))
}

async fn list_tasks(
    State(state): State<SharedState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(TaskStatus::from_str(raw).map_err(ApiError::BadRequest)?),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let tasks = state.store.list_tasks(status, limit).await?;
    Ok(Json(tasks))
}

async fn task_status(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .orchestrator
        .get_status(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;

    let human_intervention_required =
        status.status == TaskStatus::AwaitingApproval || status.pending_approvals > 0;
    Ok(Json(json!({
        "task_id": status.task_id,
        "status": status.status,
        "progress": {
            "current_phase": status.current_phase,
            "completed_phases": status.completed_phases,
            "token_usage": status.token_usage,
            "pending_approvals": status.pending_approvals,
        },
        "results": null,
        "error_message": status.error_message,
        "human_intervention_required": human_intervention_required,
        "next_action": next_action(status.status, status.pending_approvals),
    })))
}

async fn task_results(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;
    if task.status != TaskStatus::Completed {
        return Err(ApiError::BadRequest(format!(
            "Task not completed. Current status: {}",
            task.status
        )));
    }
    Ok(Json(json!({
        "task_id": task.task_id,
        "status": task.status,
        "project_data": task.input,
        "agent_outputs": task.phase_outputs,
        "quality_scores": task.quality_scores,
        "token_usage": task.token_usage,
        "created_at": task.created_at,
        "completed_at": task.updated_at,
    })))
}

async fn task_budget(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .ledger
        .recommendations(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No budget found for task {}", task_id)))?;
    Ok(Json(report))
}

async fn emergency_budget(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
    Json(req): Json<EmergencyBudgetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.additional_tokens <= 0 || req.additional_tokens > MAX_EMERGENCY_TOKENS {
        return Err(ApiError::BadRequest(format!(
            "additional_tokens must be between 1 and {}",
            MAX_EMERGENCY_TOKENS
        )));
    }
    if req.justification.trim().is_empty() {
        return Err(ApiError::BadRequest("justification is required".to_string()));
    }
    let budget = state
        .ledger
        .allocate_emergency(&task_id, req.additional_tokens, req.justification.trim())
        .await?;
    Ok(Json(json!({
        "task_id": budget.task_id,
        "total_budget": budget.total_budget,
        "consumed_tokens": budget.consumed_tokens,
        "remaining_tokens": budget.remaining_tokens(),
        "budget_exceeded": budget.budget_exceeded,
    })))
}
