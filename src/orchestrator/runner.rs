use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::outcome::{
    Decision, Expiry, OrchestrationStatus, RecoveryReport, TokenSnapshot, TokenUsageSummary,
    WorkflowOutcome,
};
use super::phase::WorkflowPhase;
use super::WorkflowSettings;
use crate::breaker::BreakerRegistry;
use crate::budget::BudgetLedger;
use crate::errors::{BreakerError, BudgetError, FailureKind, OrchestratorError};
use crate::executor::{ExecutorError, ExecutorSet, PhaseInput};
use crate::store::{
    ApprovalStatus, GateDecision, PhaseRecord, Task, TaskStatus, TaskStore, now_utc,
};

/// Upper bound on tasks inspected by startup recovery.
const RECOVERY_SCAN_LIMIT: usize = 1_000;

fn gate_recommendation(phase: &str, next: Option<&str>) -> String {
    let mut chars = phase.chars();
    let title: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    match next {
        Some(next) => format!(
            "{} phase completed. Please review findings and approve to continue to {} phase.",
            title, next
        ),
        None => format!(
            "{} phase completed. Please review findings and approve to complete the workflow.",
            title
        ),
    }
}

/// Drives tasks through their phase plan.
///
/// `execute` and `continue_after_approval` hold a per-task lock for their
/// whole run, so two triggers for the same task never interleave.
pub struct WorkflowOrchestrator {
    store: TaskStore,
    ledger: BudgetLedger,
    breakers: Arc<BreakerRegistry>,
    executors: ExecutorSet,
    settings: WorkflowSettings,
    task_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: TaskStore,
        ledger: BudgetLedger,
        breakers: Arc<BreakerRegistry>,
        executors: ExecutorSet,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            breakers,
            executors,
            settings,
            task_locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.task_locks
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    fn release_if_terminal(&self, outcome: &WorkflowOutcome) {
        if outcome.is_terminal() {
            self.task_locks.remove(outcome.task_id());
        }
    }

    fn release_if_finished(&self, task_id: &str, status: TaskStatus) {
        if status.is_terminal() {
            self.task_locks.remove(task_id);
        }
    }

    async fn load(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    fn require_status(task: &Task, expected: TaskStatus) -> Result<(), OrchestratorError> {
        if task.status == expected {
            return Ok(());
        }
        Err(OrchestratorError::InvalidState {
            task_id: task.task_id.clone(),
            status: task.status,
            expected,
        })
    }

    // ── Entry points ──────────────────────────────────────────────────

    /// Start a PENDING task: set up its budget and run the first phase.
    pub async fn execute(&self, task_id: &str) -> Result<WorkflowOutcome, OrchestratorError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load(task_id).await?;
        Self::require_status(&task, TaskStatus::Pending)?;

        let phase = self.settings.plan.first().to_string();
        info!(
            task_id,
            phase = %phase,
            depth = %task.input.analysis_depth,
            "Starting workflow"
        );

        let outcome = match self.start(&task, &phase).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(
                    task_id,
                    Some(&phase),
                    FailureKind::Storage,
                    format!("Orchestration error: {}", e),
                )
                .await?
            }
        };
        self.release_if_terminal(&outcome);
        Ok(outcome)
    }

    /// Advance an APPROVED task: run the next phase, or complete the task when
    /// every phase has output. `modifications` reach the next phase as
    /// `context_data.modifications`.
    pub async fn continue_after_approval(
        &self,
        task_id: &str,
        modifications: Option<Value>,
    ) -> Result<WorkflowOutcome, OrchestratorError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load(task_id).await?;
        Self::require_status(&task, TaskStatus::Approved)?;

        let outcome = match self.advance(&task, modifications).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let phase = self.settings.plan.next_for(&task).map(str::to_string);
                self.fail(
                    task_id,
                    phase.as_deref(),
                    FailureKind::Storage,
                    format!("Post-approval error: {}", e),
                )
                .await?
            }
        };
        self.release_if_terminal(&outcome);
        Ok(outcome)
    }

    /// Run `execute` in the background.
    pub fn spawn_execute(self: &Arc<Self>, task_id: String) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.execute(&task_id).await {
                Ok(outcome) => debug!(task_id = %task_id, ?outcome, "Background execution finished"),
                Err(e) => error!(task_id = %task_id, error = %e, "Background execution failed"),
            }
        })
    }

    /// Run `continue_after_approval` in the background.
    pub fn spawn_continue(
        self: &Arc<Self>,
        task_id: String,
        modifications: Option<Value>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.continue_after_approval(&task_id, modifications).await {
                Ok(outcome) => debug!(task_id = %task_id, ?outcome, "Background continuation finished"),
                Err(e) => error!(task_id = %task_id, error = %e, "Background continuation failed"),
            }
        })
    }

    // ── Phase driving ─────────────────────────────────────────────────

    async fn start(&self, task: &Task, phase: &str) -> Result<WorkflowOutcome, OrchestratorError> {
        let task_id = task.task_id.as_str();
        match self
            .ledger
            .initialize(task_id, task.input.analysis_depth, task.input.token_budget)
            .await
        {
            Ok(_) => {}
            Err(BudgetError::AlreadyInitialized { .. }) => {
                debug!(task_id, "Reusing existing budget");
            }
            Err(e @ BudgetError::InvalidAmount { .. }) => {
                return self
                    .fail(task_id, Some(phase), FailureKind::Validation, e.to_string())
                    .await;
            }
            Err(e) => return Err(e.into()),
        }

        self.store
            .update_status(task_id, TaskStatus::Running, None, None)
            .await?;
        self.run_phase(task, phase, json!({})).await
    }

    async fn advance(
        &self,
        task: &Task,
        modifications: Option<Value>,
    ) -> Result<WorkflowOutcome, OrchestratorError> {
        let Some(next) = self.settings.plan.next_for(task) else {
            return self.complete(task).await;
        };
        let next = next.to_string();

        self.store
            .update_status(&task.task_id, TaskStatus::Running, None, None)
            .await?;
        let context = json!({
            "modifications": modifications.unwrap_or(Value::Null),
            "previous_outputs": task.phase_outputs,
        });
        self.run_phase(task, &next, context).await
    }

    async fn run_phase(
        &self,
        task: &Task,
        phase: &str,
        context: Value,
    ) -> Result<WorkflowOutcome, OrchestratorError> {
        let task_id = task.task_id.as_str();

        let allocation = self.ledger.get_phase_allocation(task_id, phase).await?;
        if allocation < self.settings.min_phase_tokens {
            warn!(
                task_id,
                phase,
                allocation,
                min_phase_tokens = self.settings.min_phase_tokens,
                "Phase allocation below minimum"
            );
            return self
                .fail(
                    task_id,
                    Some(phase),
                    FailureKind::InsufficientBudget,
                    format!("Insufficient {} budget: {} tokens", phase, allocation),
                )
                .await;
        }

        let Some(executor) = self.executors.for_phase(phase) else {
            let err = OrchestratorError::NoExecutor {
                phase: phase.to_string(),
            };
            return self
                .fail(task_id, Some(phase), FailureKind::Executor, err.to_string())
                .await;
        };
        let breaker = self.breakers.get(executor.name()).await?;

        let input = PhaseInput {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            project_name: task.input.project_name.clone(),
            description: task.input.description.clone(),
            depth: task.input.analysis_depth,
            token_budget: allocation,
            context_data: context,
            timestamp: now_utc(),
        };
        debug!(task_id, phase, executor = executor.name(), allocation, "Invoking executor");

        // A reported failure or a malformed output is turned into an error
        // here so the breaker counts it and nothing is consumed.
        let call_executor = Arc::clone(&executor);
        let result = breaker
            .call(move || async move {
                match call_executor.execute(&input).await {
                    Ok(output) if output.success && !output.confidence_in_range() => {
                        Err(ExecutorError::with_tokens(
                            format!("Executor reported invalid confidence {}", output.confidence),
                            output.tokens_used,
                        ))
                    }
                    Ok(output) if output.success && output.tokens_used < 0 => Err(ExecutorError::new(
                        format!("Executor reported negative token usage {}", output.tokens_used),
                    )),
                    Ok(output) if output.success => Ok(output),
                    Ok(output) => Err(ExecutorError::with_tokens(
                        output
                            .error_message
                            .unwrap_or_else(|| "Executor reported failure".to_string()),
                        output.tokens_used,
                    )),
                    Err(err) => Err(err),
                }
            })
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let kind = if err.is_open() {
                    FailureKind::BreakerOpen
                } else {
                    FailureKind::Executor
                };
                if let BreakerError::Inner(inner) = &err
                    && inner.tokens_attempted > 0
                {
                    debug!(task_id, phase, tokens_attempted = inner.tokens_attempted, "Failed call spent tokens");
                }
                return self
                    .fail(
                        task_id,
                        Some(phase),
                        kind,
                        format!("Phase '{}' failed: {}", phase, err),
                    )
                    .await;
            }
        };

        if !self
            .ledger
            .consume(task_id, phase, output.tokens_used)
            .await?
        {
            return self
                .fail(
                    task_id,
                    Some(phase),
                    FailureKind::BudgetExceeded,
                    format!("Token budget exceeded: attempted {} tokens", output.tokens_used),
                )
                .await;
        }

        let recorded = serde_json::to_value(&output).context("Failed to encode phase output")?;
        self.store
            .update_status(
                task_id,
                TaskStatus::Running,
                Some(PhaseRecord {
                    phase: phase.to_string(),
                    output: recorded.clone(),
                    quality: output.confidence,
                    tokens_used: output.tokens_used,
                }),
                None,
            )
            .await?;

        let recommendation = gate_recommendation(phase, self.settings.plan.after(phase));
        let approval_id = self
            .store
            .create_approval_request(
                task_id,
                phase,
                recorded,
                &recommendation,
                Some(output.confidence),
                self.settings.approval_ttl,
            )
            .await?;
        self.store
            .update_status(task_id, TaskStatus::AwaitingApproval, None, None)
            .await?;

        info!(
            task_id,
            phase,
            approval_id,
            tokens_used = output.tokens_used,
            confidence = output.confidence,
            "Phase complete, awaiting human approval"
        );

        Ok(WorkflowOutcome::AwaitingApproval {
            task_id: task_id.to_string(),
            current_phase: phase.to_string(),
            approval_id,
            partial_results: output.data,
            recommendation,
            human_intervention: true,
            next_action: "human_approval_required".to_string(),
        })
    }

    async fn complete(&self, task: &Task) -> Result<WorkflowOutcome, OrchestratorError> {
        let task_id = task.task_id.as_str();
        let budget = self
            .ledger
            .get_budget(task_id)
            .await?
            .ok_or_else(|| BudgetError::NotFound {
                task_id: task_id.to_string(),
            })?;
        let human_interventions = self.store.approved_count(task_id).await?;
        let done = self
            .store
            .update_status(task_id, TaskStatus::Completed, None, None)
            .await?;

        let token_usage = TokenUsageSummary::from(&budget);
        info!(
            task_id,
            consumed_tokens = token_usage.consumed_tokens,
            human_interventions,
            "Workflow completed"
        );

        Ok(WorkflowOutcome::Completed {
            task_id: task_id.to_string(),
            phases_completed: self.settings.plan.completed(&done),
            final_results: done.phase_outputs,
            human_interventions,
            token_usage,
        })
    }

    /// Persist a failure and build the matching outcome.
    async fn fail(
        &self,
        task_id: &str,
        phase: Option<&str>,
        kind: FailureKind,
        message: String,
    ) -> Result<WorkflowOutcome, OrchestratorError> {
        error!(task_id, phase = phase.unwrap_or(""), kind = %kind, error = %message, "Workflow failed");
        self.store
            .update_status(task_id, TaskStatus::Failed, None, Some(message.clone()))
            .await?;
        Ok(WorkflowOutcome::Failed {
            task_id: task_id.to_string(),
            failed_phase: phase.map(str::to_string),
            kind,
            error: message,
        })
    }

    // ── Approval gate ─────────────────────────────────────────────────

    /// Open an approval for `phase` and park the task. The task must be
    /// RUNNING or already AWAITING_APPROVAL, and no other approval for the
    /// same phase may be pending.
    pub async fn request_approval(
        &self,
        task_id: &str,
        phase: &str,
        output: Value,
        recommendation: &str,
        quality_score: Option<f64>,
    ) -> Result<i64, OrchestratorError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load(task_id).await?;
        if !matches!(task.status, TaskStatus::Running | TaskStatus::AwaitingApproval) {
            self.release_if_finished(task_id, task.status);
            return Err(OrchestratorError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
                expected: TaskStatus::Running,
            });
        }
        let pending = self.store.get_pending_approvals(task_id).await?;
        if pending.iter().any(|a| a.phase == phase) {
            return Err(OrchestratorError::DuplicateApproval {
                task_id: task_id.to_string(),
                phase: phase.to_string(),
            });
        }

        let approval_id = self
            .store
            .create_approval_request(
                task_id,
                phase,
                output,
                recommendation,
                quality_score,
                self.settings.approval_ttl,
            )
            .await?;
        if task.status != TaskStatus::AwaitingApproval {
            self.store
                .update_status(task_id, TaskStatus::AwaitingApproval, None, None)
                .await?;
        }
        Ok(approval_id)
    }

    /// Apply a reviewer decision. Returns `None` when the approval does not
    /// exist or was already decided; the stored decision is left untouched.
    ///
    /// The approval status, its audit entry and the task transition commit
    /// together under the task lock. If the task cannot take the transition
    /// the call fails and the approval stays pending.
    pub async fn apply_decision(
        &self,
        approval_id: i64,
        approved: bool,
        feedback: Option<String>,
        modifications: Option<Value>,
    ) -> Result<Option<Decision>, OrchestratorError> {
        let Some(approval) = self.store.get_approval(approval_id).await? else {
            return Ok(None);
        };
        let lock = self.task_lock(&approval.task_id);
        let _guard = lock.lock().await;

        let task = self.load(&approval.task_id).await?;
        let (status, task_status, task_error) = if approved {
            (ApprovalStatus::Approved, TaskStatus::Approved, None)
        } else {
            let message = format!(
                "Human rejected approval for phase {}: {}",
                approval.phase,
                feedback.as_deref().unwrap_or("No feedback provided")
            );
            (ApprovalStatus::Rejected, TaskStatus::Failed, Some(message))
        };
        let decided = self
            .store
            .decide_approval(GateDecision {
                approval_id,
                status,
                feedback: feedback.clone(),
                audit_type: "human_review",
                audit: json!({
                    "approval_id": approval_id,
                    "decision": status,
                    "feedback": feedback,
                    "modifications": modifications,
                    "quality_score": approval.quality_score,
                }),
                task_status: Some(task_status),
                task_error,
            })
            .await;
        let decided = match decided {
            Ok(decided) => decided,
            Err(e) => {
                self.release_if_finished(&task.task_id, task.status);
                return Err(e.into());
            }
        };
        let Some(after) = decided else {
            debug!(approval_id, "Approval already processed");
            self.release_if_finished(&task.task_id, task.status);
            return Ok(None);
        };

        if approved {
            info!(task_id = %approval.task_id, phase = %approval.phase, approval_id, "Phase approved");
            Ok(Some(Decision::Approved {
                task_id: approval.task_id,
                phase: approval.phase,
            }))
        } else {
            warn!(
                task_id = %approval.task_id,
                phase = %approval.phase,
                approval_id,
                kind = %FailureKind::Rejected,
                "Phase rejected"
            );
            self.release_if_finished(&after.task_id, after.status);
            Ok(Some(Decision::Rejected {
                task_id: approval.task_id,
                phase: approval.phase,
            }))
        }
    }

    /// Force a pending approval to EXPIRED. When it was the task's last open
    /// gate and the task is parked, the task expires with it. Returns `None`
    /// when nothing changed.
    pub async fn expire_approval(&self, approval_id: i64) -> Result<Option<Expiry>, OrchestratorError> {
        let Some(approval) = self.store.get_approval(approval_id).await? else {
            return Ok(None);
        };
        let lock = self.task_lock(&approval.task_id);
        let _guard = lock.lock().await;

        let task = self.load(&approval.task_id).await?;
        let other_gates = self
            .store
            .get_pending_approvals(&approval.task_id)
            .await?
            .iter()
            .any(|a| a.approval_id != approval_id);
        let expire_task = task.status == TaskStatus::AwaitingApproval && !other_gates;

        let decided = self
            .store
            .decide_approval(GateDecision {
                approval_id,
                status: ApprovalStatus::Expired,
                feedback: Some("Manually expired by administrator".to_string()),
                audit_type: "manual_expiry",
                audit: json!({ "approval_id": approval_id, "task_expired": expire_task }),
                task_status: expire_task.then_some(TaskStatus::Expired),
                task_error: None,
            })
            .await?;
        let Some(after) = decided else {
            self.release_if_finished(&task.task_id, task.status);
            return Ok(None);
        };

        let expiry = Expiry {
            task_id: approval.task_id,
            phase: approval.phase,
            task_status: after.status,
        };
        match expiry.failure_kind() {
            Some(kind) => {
                warn!(task_id = %expiry.task_id, approval_id, kind = %kind, "Approval expired manually, task expired");
            }
            None => warn!(task_id = %expiry.task_id, approval_id, "Approval expired manually"),
        }
        self.release_if_finished(&expiry.task_id, after.status);
        Ok(Some(expiry))
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub async fn get_status(
        &self,
        task_id: &str,
    ) -> Result<Option<OrchestrationStatus>, OrchestratorError> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(None);
        };
        let pending = self.store.get_pending_approvals(task_id).await?;
        let approved = self.store.approved_count(task_id).await?;
        let budget = self.ledger.get_budget(task_id).await?;

        let phase = WorkflowPhase::project(&self.settings.plan, &task, &pending, approved);
        let token_usage = budget
            .map(|b| TokenSnapshot {
                consumed: b.consumed_tokens,
                remaining: b.remaining_tokens(),
                budget_exceeded: b.budget_exceeded,
            })
            .unwrap_or_default();

        Ok(Some(OrchestrationStatus {
            task_id: task.task_id,
            status: task.status,
            current_phase: phase.label(),
            pending_approvals: pending.len(),
            completed_phases: task.phase_outputs.keys().cloned().collect(),
            token_usage,
            created_at: task.created_at,
            updated_at: task.updated_at,
            error_message: task.error_message,
        }))
    }

    // ── Recovery ──────────────────────────────────────────────────────

    /// Reconcile tasks left in flight by a previous process.
    ///
    /// RUNNING tasks lost their phase call and are failed; APPROVED tasks are
    /// continued; PENDING tasks are started (an existing budget is reused).
    pub async fn recover_interrupted(self: &Arc<Self>) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();
        for task in self.store.list_active_tasks(RECOVERY_SCAN_LIMIT).await? {
            match task.status {
                TaskStatus::Running => {
                    self.store
                        .update_status(
                            &task.task_id,
                            TaskStatus::Failed,
                            None,
                            Some("Interrupted by process restart".to_string()),
                        )
                        .await?;
                    report.failed.push(task.task_id);
                }
                TaskStatus::Approved => {
                    self.spawn_continue(task.task_id.clone(), None);
                    report.resumed.push(task.task_id);
                }
                TaskStatus::Pending => {
                    self.spawn_execute(task.task_id.clone());
                    report.restarted.push(task.task_id);
                }
                _ => {}
            }
        }
        if !report.failed.is_empty() || !report.resumed.is_empty() || !report.restarted.is_empty() {
            info!(
                failed = report.failed.len(),
                resumed = report.resumed.len(),
                restarted = report.restarted.len(),
                "Recovered interrupted workflows"
            );
        }
        Ok(report)
    }
}
