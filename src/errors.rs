//! Typed error hierarchy for phasegate.
//!
//! One enum per subsystem:
//! - `StoreError` — task store invariants (missing rows, illegal transitions)
//! - `BudgetError` — budget ledger failures
//! - `BreakerError<E>` — circuit breaker rejections wrapping the raw call error
//! - `OrchestratorError` — workflow driving failures
//!
//! `FailureKind` classifies why a workflow stopped; it is what callers and
//! operators see on a failed outcome.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::models::TaskStatus;

/// Errors raised by the task store. Storage closures return `anyhow::Result`,
/// so these travel inside `anyhow::Error` and are recovered with `downcast_ref`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("Approval {approval_id} not found")]
    ApprovalNotFound { approval_id: i64 },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    IllegalTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task_id} already exists")]
    DuplicateTask { task_id: String },
}

/// Errors from the budget ledger.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("No budget found for task {task_id}")]
    NotFound { task_id: String },

    #[error("Budget already initialized for task {task_id}")]
    AlreadyInitialized { task_id: String },

    #[error("Invalid token amount {amount}: {reason}")]
    InvalidAmount { amount: i64, reason: &'static str },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors from a call made through a circuit breaker. `Inner` carries the
/// wrapped call's own error untouched.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("Call through '{name}' timed out after {}s", .timeout.as_secs())]
    Timeout { name: String, timeout: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Errors from the workflow orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("Task {task_id} is {status}, expected {expected}")]
    InvalidState {
        task_id: String,
        status: TaskStatus,
        expected: TaskStatus,
    },

    #[error("No executor registered for phase '{phase}'")]
    NoExecutor { phase: String },

    #[error("An approval for phase '{phase}' of task {task_id} is already pending")]
    DuplicateApproval { task_id: String, phase: String },

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a workflow stopped without completing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    InsufficientBudget,
    Executor,
    BreakerOpen,
    BudgetExceeded,
    Storage,
    Rejected,
    Expired,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::InsufficientBudget => "insufficient_budget",
            Self::Executor => "executor",
            Self::BreakerOpen => "breaker_open",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Storage => "storage",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
