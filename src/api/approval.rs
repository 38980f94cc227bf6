use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;

use super::{ApiError, SharedState};
use crate::orchestrator::Decision;
use crate::store::{ApprovalRequest, ApprovalStatus, TaskStatus};

const HISTORY_LIMIT: usize = 10;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/approval/request", post(request_approval))
        .route("/approval/pending/{task_id}", get(pending_approvals))
        .route("/approval/respond/{approval_id}", post(respond))
        .route("/approval/status/{task_id}", get(approval_status))
        .route("/approval/expire/{approval_id}", delete(expire))
        .route("/approval/health", get(approval_health))
}

// ── Payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ApprovalRequestBody {
    pub task_id: String,
    pub phase: String,
    pub agent_output: Value,
    pub recommendation: String,
    #[serde(default, alias = "confidence_score")]
    pub quality_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalResponseBody {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub modifications: Option<Value>,
}

/// Approval as returned to clients (without the reviewed payload).
#[derive(Debug, Serialize)]
pub struct ApprovalView {
    pub approval_id: i64,
    pub task_id: String,
    pub phase: String,
    pub status: ApprovalStatus,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer_feedback: Option<String>,
}

impl From<ApprovalRequest> for ApprovalView {
    fn from(a: ApprovalRequest) -> Self {
        Self {
            approval_id: a.approval_id,
            task_id: a.task_id,
            phase: a.phase,
            status: a.status,
            submitted_at: a.submitted_at,
            expires_at: a.expires_at,
            reviewed_at: a.reviewed_at,
            reviewer_feedback: a.reviewer_feedback,
        }
    }
}

fn not_processed() -> ApiError {
    ApiError::NotFound("Approval not found or already processed".to_string())
}

/// What a reviewer-facing client should do next.
fn review_action(status: TaskStatus, pending: usize) -> &'static str {
    if pending > 0 {
        return "await_human_review";
    }
    match status {
        TaskStatus::Failed => "review_failure",
        TaskStatus::Expired => "handle_expiration",
        _ => "continue_execution",
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn request_approval(
    State(state): State<SharedState>,
    Json(body): Json<ApprovalRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(score) = body.quality_score
        && !(0.0..=1.0).contains(&score)
    {
        return Err(ApiError::BadRequest(
            "quality_score must be between 0 and 1".to_string(),
        ));
    }
    if body.phase.trim().is_empty() {
        return Err(ApiError::BadRequest("phase is required".to_string()));
    }

    let approval_id = state
        .orchestrator
        .request_approval(
            &body.task_id,
            &body.phase,
            body.agent_output,
            &body.recommendation,
            body.quality_score,
        )
        .await?;
    let approval = state
        .store
        .get_approval(approval_id)
        .await?
        .ok_or_else(not_processed)?;
    Ok((StatusCode::CREATED, Json(ApprovalView::from(approval))))
}

async fn pending_approvals(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_task(&task_id).await?.is_none() {
        return Err(ApiError::NotFound("Task not found".to_string()));
    }
    let pending = state.store.get_pending_approvals(&task_id).await?;
    Ok(Json(pending))
}

async fn respond(
    State(state): State<SharedState>,
    Path(approval_id): Path<i64>,
    Json(body): Json<ApprovalResponseBody>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = state
        .orchestrator
        .apply_decision(
            approval_id,
            body.approved,
            body.feedback,
            body.modifications.clone(),
        )
        .await?
        .ok_or_else(not_processed)?;

    let next_action = match &decision {
        Decision::Approved { task_id, .. } => {
            state
                .orchestrator
                .spawn_continue(task_id.clone(), body.modifications);
            "continue_execution"
        }
        Decision::Rejected { .. } => "task_failed",
    };

    Ok(Json(json!({
        "message": "Approval processed successfully",
        "approval_id": approval_id,
        "task_id": decision.task_id(),
        "decision": if body.approved { "approved" } else { "rejected" },
        "next_action": next_action,
        "failure_kind": decision.failure_kind(),
    })))
}

async fn approval_status(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".to_string()))?;
    let pending = state.store.get_pending_approvals(&task_id).await?;
    let history: Vec<Value> = state
        .store
        .approval_history(&task_id, HISTORY_LIMIT)
        .await?
        .into_iter()
        .map(|a| {
            json!({
                "approval_id": a.approval_id,
                "phase": a.phase,
                "status": a.status,
                "reviewed_at": a.reviewed_at,
                "feedback": a.reviewer_feedback,
            })
        })
        .collect();

    let intervention_context = match pending.first() {
        Some(first) if task.status == TaskStatus::AwaitingApproval => json!({
            "trigger": "approval_gate",
            "phase": first.phase,
            "quality_score": first.quality_score,
            "recommendation": first.recommendation,
            "expires_at": first.expires_at,
        }),
        _ => Value::Null,
    };

    Ok(Json(json!({
        "task_id": task.task_id,
        "current_status": task.status,
        "pending_approvals": pending.len(),
        "approval_history": history,
        "next_action": review_action(task.status, pending.len()),
        "intervention_context": intervention_context,
    })))
}

async fn expire(
    State(state): State<SharedState>,
    Path(approval_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let expiry = state
        .orchestrator
        .expire_approval(approval_id)
        .await?
        .ok_or_else(not_processed)?;
    Ok(Json(json!({
        "message": "Approval expired successfully",
        "approval_id": approval_id,
        "task_id": expiry.task_id,
        "task_status": expiry.task_status,
        "failure_kind": expiry.failure_kind(),
    })))
}

async fn approval_health(State(state): State<SharedState>) -> impl IntoResponse {
    let cutoff = Utc::now() - chrono::Duration::hours(24);
    match state.store.approval_stats_since(cutoff).await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database_connection": "ok",
                "last_24h_stats": stats,
                "timestamp": Utc::now(),
            })),
        ),
        Err(e) => {
            error!(error = %e, "Approval health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database_connection": "error",
                    "error": e.to_string(),
                    "timestamp": Utc::now(),
                })),
            )
        }
    }
}
