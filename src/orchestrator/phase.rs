//! Where a workflow is, derived from task status, recorded outputs and gate
//! decisions. Nothing here is stored; `WorkflowPhase::project` is a pure
//! function of the task record.

use std::fmt;

use crate::store::{ApprovalRequest, Task, TaskStatus};

/// Ordered list of phases a workflow runs through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    phases: Vec<String>,
}

impl PhasePlan {
    /// Build a plan. Fails on an empty list or a repeated phase name.
    pub fn new(phases: Vec<String>) -> Result<Self, String> {
        if phases.is_empty() {
            return Err("Phase list cannot be empty".to_string());
        }
        for (i, phase) in phases.iter().enumerate() {
            if phase.trim().is_empty() {
                return Err("Phase names cannot be blank".to_string());
            }
            if phases[..i].contains(phase) {
                return Err(format!("Duplicate phase name: {}", phase));
            }
        }
        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    pub fn first(&self) -> &str {
        &self.phases[0]
    }

    /// First phase in the plan the task has no output for.
    pub fn next_for(&self, task: &Task) -> Option<&str> {
        self.phases
            .iter()
            .find(|p| !task.has_output(p))
            .map(String::as_str)
    }

    /// The phase after `phase`, if any.
    pub fn after(&self, phase: &str) -> Option<&str> {
        let idx = self.phases.iter().position(|p| p == phase)?;
        self.phases.get(idx + 1).map(String::as_str)
    }

    /// Phases with recorded output, in plan order.
    pub fn completed(&self, task: &Task) -> Vec<String> {
        self.phases
            .iter()
            .filter(|p| task.has_output(p))
            .cloned()
            .collect()
    }
}

impl Default for PhasePlan {
    fn default() -> Self {
        Self {
            phases: vec!["research".to_string()],
        }
    }
}

/// Human-facing position of a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowPhase {
    Initialization,
    /// A phase is executing.
    Running { phase: String },
    /// A phase has produced output that has not reached its gate yet.
    PhaseComplete { phase: String },
    /// Waiting on a reviewer; `phase` is the oldest pending gate.
    AwaitingApproval { phase: Option<String> },
    /// Gate passed, next step not started.
    Approved,
    Complete,
    Failed,
    Expired,
}

impl WorkflowPhase {
    /// Project a task onto its workflow position.
    ///
    /// `approved_gates` is the number of approvals granted so far; a RUNNING
    /// task with more outputs than granted gates has finished a phase that
    /// has not been submitted for review.
    pub fn project(
        plan: &PhasePlan,
        task: &Task,
        pending: &[ApprovalRequest],
        approved_gates: i64,
    ) -> Self {
        match task.status {
            TaskStatus::Pending => Self::Initialization,
            TaskStatus::Running => {
                let completed = plan.completed(task);
                match completed.last() {
                    Some(last) if completed.len() as i64 > approved_gates => Self::PhaseComplete {
                        phase: last.clone(),
                    },
                    _ => Self::Running {
                        phase: plan.next_for(task).unwrap_or(plan.first()).to_string(),
                    },
                }
            }
            TaskStatus::AwaitingApproval => Self::AwaitingApproval {
                phase: pending.first().map(|a| a.phase.clone()),
            },
            TaskStatus::Approved => Self::Approved,
            TaskStatus::Completed => Self::Complete,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::Expired => Self::Expired,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Initialization => "initialization".to_string(),
            Self::Running { phase } => phase.clone(),
            Self::PhaseComplete { phase } => format!("{}_complete", phase),
            Self::AwaitingApproval { phase: Some(phase) } => format!("awaiting_approval_{}", phase),
            Self::AwaitingApproval { phase: None } => "awaiting_approval".to_string(),
            Self::Approved => "approved".to_string(),
            Self::Complete => "complete".to_string(),
            Self::Failed => "failed".to_string(),
            Self::Expired => "expired".to_string(),
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
