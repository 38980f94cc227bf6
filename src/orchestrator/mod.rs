//! Workflow orchestration.
//!
//! A task runs its phases in plan order. Each phase:
//! 1. asks the budget ledger for its allocation (fails below `min_phase_tokens`)
//! 2. runs its executor through that executor's circuit breaker
//! 3. consumes the reported tokens (fails on whole-budget overrun)
//! 4. records the output, opens an approval request and parks the task in
//!    AWAITING_APPROVAL
//!
//! A reviewer decision moves the task to APPROVED (or FAILED on rejection);
//! `continue_after_approval` then runs the next phase or completes the task.
//! Manually expiring a task's last open gate expires the task.

pub mod outcome;
pub mod phase;
pub mod runner;

use chrono::Duration;

pub use outcome::{
    Decision, Expiry, OrchestrationStatus, RecoveryReport, TokenSnapshot, TokenUsageSummary,
    WorkflowOutcome,
};
pub use phase::{PhasePlan, WorkflowPhase};
pub use runner::WorkflowOrchestrator;

/// Knobs the orchestrator reads on every run.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub plan: PhasePlan,
    /// Smallest allocation a phase may start with.
    pub min_phase_tokens: i64,
    pub task_ttl: Duration,
    pub approval_ttl: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            plan: PhasePlan::default(),
            min_phase_tokens: 500,
            task_ttl: Duration::hours(48),
            approval_ttl: Duration::hours(24),
        }
    }
}
