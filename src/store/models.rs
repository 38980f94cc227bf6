use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use phasegate_common::DepthTier;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Task status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingApproval,
    Approved,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    /// Statuses a task can still leave.
    pub const ACTIVE: [TaskStatus; 4] = [
        Self::Pending,
        Self::Running,
        Self::AwaitingApproval,
        Self::Approved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Whether the expiry sweep may move a task in this status to EXPIRED.
    pub fn is_expirable(&self) -> bool {
        matches!(self, Self::Pending | Self::AwaitingApproval)
    }

    /// Legal edges of the task state machine. RUNNING -> RUNNING is allowed so
    /// a phase output can be attached while the task is still in flight.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running | Failed | Expired) => true,
            (Running, Running | AwaitingApproval | Completed | Failed) => true,
            (AwaitingApproval, Approved | Failed | Expired) => true,
            (Approved, Running | Completed | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "approved" => Ok(Self::Approved),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

// ── Approval status ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid approval status: {}", s)),
        }
    }
}

// ── Circuit state ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            _ => Err(format!("Invalid circuit state: {}", s)),
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────

/// Submission payload stored with a task. Unknown keys are kept in `extra`
/// so the stored JSON round-trips unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInput {
    pub project_name: String,
    pub description: String,
    #[serde(default)]
    pub analysis_depth: DepthTier,
    #[serde(default)]
    pub token_budget: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskInput {
    pub fn new(project_name: &str, description: &str, analysis_depth: DepthTier) -> Self {
        Self {
            project_name: project_name.to_string(),
            description: description.to_string(),
            analysis_depth,
            token_budget: None,
            extra: Map::new(),
        }
    }

    pub fn with_token_budget(self, token_budget: Option<i64>) -> Self {
        Self {
            token_budget,
            ..self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub input: TaskInput,
    /// Phase name -> output payload. Keys are only ever added.
    pub phase_outputs: BTreeMap<String, Value>,
    pub quality_scores: BTreeMap<String, f64>,
    pub token_usage: BTreeMap<String, i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Task {
    pub fn has_output(&self, phase: &str) -> bool {
        self.phase_outputs.contains_key(phase)
    }
}

/// One phase result to merge into a task's phase maps.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRecord {
    pub phase: String,
    pub output: Value,
    pub quality: f64,
    pub tokens_used: i64,
}

/// Everything one decision on a pending approval writes: the approval's
/// new status, an audit entry and, optionally, the task transition.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub approval_id: i64,
    pub status: ApprovalStatus,
    pub feedback: Option<String>,
    pub audit_type: &'static str,
    pub audit: Value,
    pub task_status: Option<TaskStatus>,
    pub task_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub approval_id: i64,
    pub task_id: String,
    pub phase: String,
    pub output: Value,
    pub recommendation: String,
    pub status: ApprovalStatus,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer_feedback: Option<String>,
    pub quality_score: Option<f64>,
}

/// Counts over approvals submitted since a cutoff.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApprovalStats {
    pub pending_approvals: i64,
    pub approved_count: i64,
    pub rejected_count: i64,
    pub expired_pending: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityAudit {
    pub id: i64,
    pub task_id: String,
    pub phase: String,
    pub approval_type: String,
    pub quality_data: Value,
    pub created_at: DateTime<Utc>,
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_tasks: usize,
    pub expired_approvals: usize,
}

// ── Budget state ──────────────────────────────────────────────────────

/// Token ledger for one task. Mutating helpers return a new value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetState {
    pub task_id: String,
    pub total_budget: i64,
    pub consumed_tokens: i64,
    pub phase_allocations: BTreeMap<String, i64>,
    pub usage_by_phase: BTreeMap<String, i64>,
    pub budget_exceeded: bool,
    /// Phases whose own allocation has been overrun. Informational only.
    pub exceeded_phases: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetState {
    pub fn new(
        task_id: &str,
        total_budget: i64,
        phase_allocations: BTreeMap<String, i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            total_budget,
            consumed_tokens: 0,
            phase_allocations,
            usage_by_phase: BTreeMap::new(),
            budget_exceeded: false,
            exceeded_phases: BTreeSet::new(),
            updated_at: now,
        }
    }

    pub fn remaining_tokens(&self) -> i64 {
        self.total_budget - self.consumed_tokens
    }

    pub fn phase_used(&self, phase: &str) -> i64 {
        self.usage_by_phase.get(phase).copied().unwrap_or(0)
    }

    pub fn phase_allocation(&self, phase: &str) -> i64 {
        self.phase_allocations.get(phase).copied().unwrap_or(0)
    }

    /// Tokens a phase may still spend: the lesser of its own remaining quota
    /// and the task's remaining total. Can be zero or negative.
    pub fn available_for(&self, phase: &str) -> i64 {
        let phase_remaining = self.phase_allocation(phase) - self.phase_used(phase);
        phase_remaining.min(self.remaining_tokens())
    }

    /// An amount large enough to overflow the counter always exceeds.
    pub fn would_exceed(&self, amount: i64) -> bool {
        match self.consumed_tokens.checked_add(amount) {
            Some(total) => total > self.total_budget,
            None => true,
        }
    }

    /// `None` when a counter would overflow.
    pub fn with_consumption(&self, phase: &str, amount: i64, now: DateTime<Utc>) -> Option<Self> {
        let new_phase_used = self.phase_used(phase).checked_add(amount)?;
        let consumed_tokens = self.consumed_tokens.checked_add(amount)?;
        let mut usage_by_phase = self.usage_by_phase.clone();
        usage_by_phase.insert(phase.to_string(), new_phase_used);
        let mut exceeded_phases = self.exceeded_phases.clone();
        if new_phase_used > self.phase_allocation(phase) {
            exceeded_phases.insert(phase.to_string());
        }
        Some(Self {
            consumed_tokens,
            usage_by_phase,
            exceeded_phases,
            updated_at: now,
            ..self.clone()
        })
    }

    pub fn with_exceeded(&self, now: DateTime<Utc>) -> Self {
        Self {
            budget_exceeded: true,
            updated_at: now,
            ..self.clone()
        }
    }

    /// `None` when the total would overflow.
    pub fn with_additional(&self, additional: i64, now: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            total_budget: self.total_budget.checked_add(additional)?,
            budget_exceeded: false,
            updated_at: now,
            ..self.clone()
        })
    }

    pub fn reset(&self, now: DateTime<Utc>) -> Self {
        Self {
            consumed_tokens: 0,
            usage_by_phase: BTreeMap::new(),
            budget_exceeded: false,
            exceeded_phases: BTreeSet::new(),
            updated_at: now,
            ..self.clone()
        }
    }
}

// ── Breaker record ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerRecord {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BreakerRecord {
    pub fn closed(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::AwaitingApproval,
            TaskStatus::Approved,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Expired,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::from_str("paused").is_err());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use TaskStatus::*;
        for from in [Completed, Failed, Expired] {
            assert!(from.is_terminal());
            for to in [Pending, Running, AwaitingApproval, Approved, Completed, Failed, Expired] {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Running));
        assert!(Approved.can_transition_to(Completed));
    }

    #[test]
    fn test_illegal_transitions() {
        use TaskStatus::*;
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Expired));
        assert!(!AwaitingApproval.can_transition_to(Running));
        assert!(!Approved.can_transition_to(Expired));
    }

    #[test]
    fn test_every_non_terminal_status_can_fail() {
        for status in TaskStatus::ACTIVE {
            assert!(status.can_transition_to(TaskStatus::Failed));
        }
    }

    #[test]
    fn test_task_input_keeps_unknown_keys() {
        let raw = json!({
            "project_name": "atlas",
            "description": "A mapping tool for hikers",
            "analysis_depth": "quick",
            "token_budget": null,
            "created_at": "2026-01-01T00:00:00Z",
            "source": "cli"
        });
        let input: TaskInput = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(input.analysis_depth, DepthTier::Quick);
        assert_eq!(input.extra["source"], "cli");
        assert_eq!(serde_json::to_value(&input).unwrap(), raw);
    }

    #[test]
    fn test_budget_consumption_is_copy_on_write() {
        let allocations = BTreeMap::from([("research".to_string(), 100)]);
        let state = BudgetState::new("t", 200, allocations, Utc::now());
        let next = state.with_consumption("research", 150, Utc::now()).unwrap();

        assert_eq!(state.consumed_tokens, 0);
        assert_eq!(next.consumed_tokens, 150);
        assert_eq!(next.phase_used("research"), 150);
        assert!(next.exceeded_phases.contains("research"));
        assert!(!next.budget_exceeded);
        assert_eq!(next.remaining_tokens(), 50);
    }

    #[test]
    fn test_available_for_takes_lesser_quota() {
        let allocations = BTreeMap::from([
            ("research".to_string(), 100),
            ("analysis".to_string(), 100),
        ]);
        let state = BudgetState::new("t", 120, allocations, Utc::now())
            .with_consumption("analysis", 90, Utc::now())
            .unwrap();
        assert_eq!(state.available_for("research"), 30);
        assert_eq!(state.available_for("unknown"), 0);
    }

    #[test]
    fn test_counter_overflow_is_refused() {
        let allocations = BTreeMap::from([("research".to_string(), 100)]);
        let state = BudgetState::new("t", 200, allocations, Utc::now())
            .with_consumption("research", 50, Utc::now())
            .unwrap();

        assert!(state.would_exceed(i64::MAX));
        assert!(state.with_consumption("research", i64::MAX, Utc::now()).is_none());
        assert!(state.with_additional(i64::MAX, Utc::now()).is_none());
        assert_eq!(
            state.with_additional(100, Utc::now()).unwrap().total_budget,
            300
        );
    }
}
