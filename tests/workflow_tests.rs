//! End-to-end workflow scenarios driven through the library.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use phasegate::config::PhasegateConfig;
use phasegate::context::{AppContext, default_executors};
use phasegate::errors::FailureKind;
use phasegate::executor::{ExecutorError, ExecutorSet, PhaseExecutor, PhaseInput, PhaseOutput};
use phasegate::orchestrator::WorkflowOutcome;
use phasegate::store::{ApprovalStatus, CircuitState, TaskInput, TaskStatus};
use phasegate_common::DepthTier;
use serde_json::json;
use tempfile::TempDir;

/// Replays scripted results in order and records every input it sees.
struct Scripted {
    results: Mutex<VecDeque<Result<PhaseOutput, ExecutorError>>>,
    inputs: Mutex<Vec<PhaseInput>>,
}

impl Scripted {
    fn new(results: Vec<Result<PhaseOutput, ExecutorError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            inputs: Mutex::new(Vec::new()),
        })
    }

    fn ok(tokens: i64) -> Result<PhaseOutput, ExecutorError> {
        Ok(PhaseOutput::success(json!({"summary": "ok"}), 0.9, tokens))
    }

    fn inputs(&self) -> Vec<PhaseInput> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhaseExecutor for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, input: &PhaseInput) -> Result<PhaseOutput, ExecutorError> {
        self.inputs.lock().unwrap().push(input.clone());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ExecutorError::new("script exhausted")))
    }
}

fn config_with_phases(phases: &[&str]) -> PhasegateConfig {
    let mut config = PhasegateConfig::default();
    config.workflow.phases = phases.iter().map(|p| p.to_string()).collect();
    config
}

fn input() -> TaskInput {
    TaskInput::new(
        "atlas",
        "An ecommerce store for handmade goods",
        DepthTier::Standard,
    )
}

async fn enqueue(ctx: &AppContext, task_id: &str) {
    ctx.store
        .enqueue(task_id, input(), chrono::Duration::hours(48))
        .await
        .unwrap();
}

fn approval_id(outcome: &WorkflowOutcome) -> i64 {
    match outcome {
        WorkflowOutcome::AwaitingApproval { approval_id, .. } => *approval_id,
        other => panic!("expected approval gate, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_phase_workflow_runs_to_completion() {
    let script = Scripted::new(vec![Scripted::ok(3_000), Scripted::ok(2_500)]);
    let ctx = AppContext::in_memory(
        config_with_phases(&["research", "analysis"]),
        ExecutorSet::new().with_fallback(script.clone()),
    )
    .unwrap();
    enqueue(&ctx, "t-1").await;

    let first = ctx.orchestrator.execute("t-1").await.unwrap();
    let research_gate = approval_id(&first);
    let status = ctx.orchestrator.get_status("t-1").await.unwrap().unwrap();
    assert_eq!(status.current_phase, "awaiting_approval_research");
    assert_eq!(status.token_usage.consumed, 3_000);

    ctx.orchestrator
        .apply_decision(research_gate, true, Some("good".into()), Some(json!({"focus": "b2c"})))
        .await
        .unwrap()
        .expect("decision applies");
    let second = ctx
        .orchestrator
        .continue_after_approval("t-1", Some(json!({"focus": "b2c"})))
        .await
        .unwrap();
    let analysis_gate = approval_id(&second);

    let inputs = script.inputs();
    assert_eq!(inputs[1].phase, "analysis");
    assert_eq!(inputs[1].token_budget, 6_000);
    assert_eq!(inputs[1].context_data["modifications"]["focus"], "b2c");
    assert!(inputs[1].context_data["previous_outputs"]["research"].is_object());

    ctx.orchestrator
        .apply_decision(analysis_gate, true, None, None)
        .await
        .unwrap()
        .expect("decision applies");
    let done = ctx
        .orchestrator
        .continue_after_approval("t-1", None)
        .await
        .unwrap();

    match done {
        WorkflowOutcome::Completed {
            phases_completed,
            human_interventions,
            token_usage,
            final_results,
            ..
        } => {
            assert_eq!(phases_completed, vec!["research", "analysis"]);
            assert_eq!(human_interventions, 2);
            assert_eq!(token_usage.consumed_tokens, 5_500);
            assert_eq!(token_usage.remaining_tokens, 19_500);
            assert!(!token_usage.budget_exceeded);
            assert!(final_results.contains_key("analysis"));
        }
        other => panic!("expected completion, got {:?}", other),
    }

    let task = ctx.store.get_task("t-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.token_usage["research"], 3_000);
    assert!(ctx.store.list_active_tasks(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_simulated_executor_reaches_first_gate() {
    let ctx = AppContext::in_memory(PhasegateConfig::default(), default_executors()).unwrap();
    enqueue(&ctx, "t-1").await;

    let outcome = ctx.orchestrator.execute("t-1").await.unwrap();
    match &outcome {
        WorkflowOutcome::AwaitingApproval {
            current_phase,
            partial_results,
            next_action,
            ..
        } => {
            assert_eq!(current_phase, "research");
            assert_eq!(next_action, "human_approval_required");
            assert!(partial_results["market_analysis"].is_object());
        }
        other => panic!("expected approval gate, got {:?}", other),
    }
    let budget = ctx.ledger.get_budget("t-1").await.unwrap().unwrap();
    assert_eq!(budget.consumed_tokens, 3_800);
    assert_eq!(budget.remaining_tokens(), 21_200);
}

#[tokio::test]
async fn test_expiry_sweep_closes_stale_gates() {
    let script = Scripted::new(vec![Scripted::ok(1_000)]);
    let ctx = AppContext::in_memory(
        PhasegateConfig::default(),
        ExecutorSet::new().with_fallback(script),
    )
    .unwrap();
    enqueue(&ctx, "t-1").await;
    let gate = approval_id(&ctx.orchestrator.execute("t-1").await.unwrap());
    assert_eq!(ctx.store.list_active_tasks(10).await.unwrap().len(), 1);

    let later = chrono::Utc::now() + chrono::Duration::hours(49);
    let report = ctx.store.sweep(later).await.unwrap();
    assert_eq!(report.expired_tasks, 1);
    assert_eq!(report.expired_approvals, 1);

    // A second sweep finds nothing left to expire.
    let again = ctx.store.sweep(later).await.unwrap();
    assert_eq!(again.expired_tasks, 0);
    assert_eq!(again.expired_approvals, 0);

    let task = ctx.store.get_task("t-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Expired);
    assert!(ctx.store.list_active_tasks(10).await.unwrap().is_empty());

    let approval = ctx.store.get_approval(gate).await.unwrap().unwrap();
    assert_eq!(approval.status, ApprovalStatus::Expired);
    let decision = ctx
        .orchestrator
        .apply_decision(gate, true, None, None)
        .await
        .unwrap();
    assert!(decision.is_none());
}

#[tokio::test]
async fn test_open_breaker_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = PhasegateConfig::default();
    config.database.path = dir.path().join("pg.db");
    config.breaker.failure_threshold = 1;

    {
        let script = Scripted::new(vec![Err(ExecutorError::new("upstream down"))]);
        let db = phasegate::store::DbHandle::open(&config.database.path).unwrap();
        let ctx = AppContext::new(
            config.clone(),
            db,
            ExecutorSet::new().with_fallback(script),
        )
        .unwrap();
        enqueue(&ctx, "t-1").await;
        let outcome = ctx.orchestrator.execute("t-1").await.unwrap();
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Executor));
    }

    let script = Scripted::new(vec![Scripted::ok(1_000)]);
    let db = phasegate::store::DbHandle::open(&config.database.path).unwrap();
    let ctx = AppContext::new(config, db, ExecutorSet::new().with_fallback(script.clone())).unwrap();

    let breakers = ctx.breakers.all_status().await.unwrap();
    assert_eq!(breakers["scripted"].state, CircuitState::Open);

    enqueue(&ctx, "t-2").await;
    let outcome = ctx.orchestrator.execute("t-2").await.unwrap();
    assert_eq!(outcome.failure_kind(), Some(FailureKind::BreakerOpen));
    assert!(script.inputs().is_empty());
}

#[tokio::test]
async fn test_recovery_fails_running_and_restarts_pending() {
    let dir = TempDir::new().unwrap();
    let mut config = PhasegateConfig::default();
    config.database.path = dir.path().join("pg.db");

    {
        let ctx = AppContext::open(config.clone()).unwrap();
        enqueue(&ctx, "running").await;
        enqueue(&ctx, "pending").await;
        ctx.store
            .update_status("running", TaskStatus::Running, None, None)
            .await
            .unwrap();
    }

    let script = Scripted::new(vec![Scripted::ok(1_000)]);
    let db = phasegate::store::DbHandle::open(&config.database.path).unwrap();
    let ctx = AppContext::new(config, db, ExecutorSet::new().with_fallback(script)).unwrap();
    let report = ctx.orchestrator.recover_interrupted().await.unwrap();
    assert_eq!(report.failed, vec!["running".to_string()]);
    assert_eq!(report.restarted, vec!["pending".to_string()]);

    let running = ctx.store.get_task("running").await.unwrap().unwrap();
    assert_eq!(running.status, TaskStatus::Failed);
    assert_eq!(
        running.error_message.as_deref(),
        Some("Interrupted by process restart")
    );

    for _ in 0..100 {
        let task = ctx.store.get_task("pending").await.unwrap().unwrap();
        if task.status == TaskStatus::AwaitingApproval {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("pending task was not restarted");
}
