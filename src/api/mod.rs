//! HTTP surface: thin request/response mapping over the orchestrator, the
//! task store, the budget ledger and the breaker registry.

pub mod approval;
pub mod breakers;
pub mod server;
pub mod tasks;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::context::AppContext;
use crate::errors::{BudgetError, OrchestratorError, StoreError};

pub type SharedState = Arc<AppContext>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::TaskNotFound { .. } | StoreError::ApprovalNotFound { .. }) => {
                ApiError::NotFound(err.to_string())
            }
            Some(StoreError::IllegalTransition { .. } | StoreError::DuplicateTask { .. }) => {
                ApiError::Conflict(err.to_string())
            }
            None => ApiError::Internal(format!("{:#}", err)),
        }
    }
}

impl From<BudgetError> for ApiError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            BudgetError::InvalidAmount { .. } => ApiError::BadRequest(err.to_string()),
            BudgetError::AlreadyInitialized { .. } => ApiError::Conflict(err.to_string()),
            BudgetError::Storage(inner) => inner.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::TaskNotFound { .. } => ApiError::NotFound(err.to_string()),
            OrchestratorError::InvalidState { .. } => ApiError::BadRequest(err.to_string()),
            OrchestratorError::DuplicateApproval { .. } => ApiError::Conflict(err.to_string()),
            OrchestratorError::NoExecutor { .. } => ApiError::Internal(err.to_string()),
            OrchestratorError::Budget(inner) => inner.into(),
            OrchestratorError::Other(inner) => inner.into(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router() -> Router<SharedState> {
    Router::new()
        .merge(tasks::routes())
        .merge(approval::routes())
        .merge(breakers::routes())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_status_codes() {
        let err: anyhow::Error = StoreError::TaskNotFound {
            task_id: "t-1".into(),
        }
        .into();
        assert!(matches!(ApiError::from(err), ApiError::NotFound(_)));

        let err: anyhow::Error = StoreError::IllegalTransition {
            task_id: "t-1".into(),
            from: crate::store::TaskStatus::Completed,
            to: crate::store::TaskStatus::Running,
        }
        .into();
        assert!(matches!(ApiError::from(err), ApiError::Conflict(_)));

        let err = anyhow::anyhow!("disk full");
        assert!(matches!(ApiError::from(err), ApiError::Internal(_)));
    }

    #[test]
    fn test_orchestrator_errors_map_to_status_codes() {
        let err = OrchestratorError::DuplicateApproval {
            task_id: "t-1".into(),
            phase: "research".into(),
        };
        assert!(matches!(ApiError::from(err), ApiError::Conflict(_)));

        let err = OrchestratorError::Budget(BudgetError::NotFound {
            task_id: "t-1".into(),
        });
        assert!(matches!(ApiError::from(err), ApiError::NotFound(_)));
    }

    #[test]
    fn test_error_body_shape() {
        let response = ApiError::Conflict("already pending".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
