use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::{efficiency_score, utilisation_score};
use crate::errors::FailureKind;
use crate::store::{BudgetState, TaskStatus};

/// What a call to `execute` or `continue_after_approval` left behind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    AwaitingApproval {
        task_id: String,
        current_phase: String,
        approval_id: i64,
        partial_results: Value,
        recommendation: String,
        human_intervention: bool,
        next_action: String,
    },
    Failed {
        task_id: String,
        failed_phase: Option<String>,
        kind: FailureKind,
        error: String,
    },
    Completed {
        task_id: String,
        phases_completed: Vec<String>,
        final_results: BTreeMap<String, Value>,
        human_interventions: i64,
        token_usage: TokenUsageSummary,
    },
}

impl WorkflowOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            Self::AwaitingApproval { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Completed { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AwaitingApproval { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Final budget summary attached to a completed workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenUsageSummary {
    pub total_budget: i64,
    pub consumed_tokens: i64,
    pub remaining_tokens: i64,
    pub usage_by_phase: BTreeMap<String, i64>,
    pub budget_exceeded: bool,
    pub efficiency_score: f64,
    pub utilisation_score: f64,
}

impl From<&BudgetState> for TokenUsageSummary {
    fn from(state: &BudgetState) -> Self {
        Self {
            total_budget: state.total_budget,
            consumed_tokens: state.consumed_tokens,
            remaining_tokens: state.remaining_tokens(),
            usage_by_phase: state.usage_by_phase.clone(),
            budget_exceeded: state.budget_exceeded,
            efficiency_score: efficiency_score(state),
            utilisation_score: utilisation_score(state),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenSnapshot {
    pub consumed: i64,
    pub remaining: i64,
    pub budget_exceeded: bool,
}

/// Read-only projection of a workflow for status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationStatus {
    pub task_id: String,
    pub status: crate::store::TaskStatus,
    pub current_phase: String,
    pub pending_approvals: usize,
    pub completed_phases: Vec<String>,
    pub token_usage: TokenSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Outcome of a reviewer decision on one approval.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Gate passed; the task is APPROVED and ready for `continue_after_approval`.
    Approved { task_id: String, phase: String },
    /// Gate refused; the task is FAILED.
    Rejected { task_id: String, phase: String },
}

impl Decision {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Approved { task_id, .. } | Self::Rejected { task_id, .. } => task_id,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Approved { .. } => None,
            Self::Rejected { .. } => Some(FailureKind::Rejected),
        }
    }
}

/// Result of forcibly expiring one approval.
#[derive(Debug, Clone, PartialEq)]
pub struct Expiry {
    pub task_id: String,
    pub phase: String,
    /// Task status afterwards. EXPIRED when this was its last open gate.
    pub task_status: TaskStatus,
}

impl Expiry {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        (self.task_status == TaskStatus::Expired).then_some(FailureKind::Expired)
    }
}

/// What startup recovery did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed: Vec<String>,
    pub resumed: Vec<String>,
    pub restarted: Vec<String>,
}
