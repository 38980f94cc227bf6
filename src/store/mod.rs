//! Durable workflow state: tasks, approval requests, budgets, breaker state
//! and the approval audit log, all in one SQLite file.
//!
//! `db` holds the synchronous `WorkflowDb` plus the async `DbHandle`;
//! `TaskStore` is the async surface the orchestrator and API use for task and
//! approval records. Budget and breaker tables are reached through their own
//! subsystems (`budget`, `breaker`) on the same handle.

pub mod db;
pub mod models;
pub mod rows;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{info, warn};

use anyhow::Result;

pub use db::{DbHandle, WorkflowDb};
pub use models::*;
pub use rows::now_utc;

/// Async task-store operations over a shared [`DbHandle`].
#[derive(Clone)]
pub struct TaskStore {
    db: DbHandle,
}

impl TaskStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn ping(&self) -> Result<()> {
        self.db.call(|db| db.ping()).await
    }

    pub async fn enqueue(&self, task_id: &str, input: TaskInput, ttl: Duration) -> Result<Task> {
        let id = task_id.to_string();
        let task = self
            .db
            .call(move |db| db.enqueue_task(&id, &input, ttl, now_utc()))
            .await?;
        info!(
            task_id = %task.task_id,
            expires_at = ?task.expires_at,
            "Task enqueued"
        );
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let id = task_id.to_string();
        self.db.call(move |db| db.get_task(&id)).await
    }

    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        record: Option<PhaseRecord>,
        error: Option<String>,
    ) -> Result<Task> {
        let id = task_id.to_string();
        let task = self
            .db
            .call(move |db| {
                db.update_task_status(&id, status, record.as_ref(), error.as_deref(), now_utc())
            })
            .await?;
        info!(
            task_id = %task.task_id,
            status = %task.status,
            error = task.error_message.as_deref().unwrap_or(""),
            "Task status updated"
        );
        Ok(task)
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        self.db.call(move |db| db.list_tasks(status, limit)).await
    }

    pub async fn list_active_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        self.db.call(move |db| db.list_active_tasks(limit)).await
    }

    pub async fn create_approval_request(
        &self,
        task_id: &str,
        phase: &str,
        output: Value,
        recommendation: &str,
        quality_score: Option<f64>,
        ttl: Duration,
    ) -> Result<i64> {
        let (id, ph, rec) = (
            task_id.to_string(),
            phase.to_string(),
            recommendation.to_string(),
        );
        let approval_id = self
            .db
            .call(move |db| {
                db.create_approval_request(&id, &ph, &output, &rec, quality_score, ttl, now_utc())
            })
            .await?;
        info!(task_id, phase, approval_id, "Approval request created");
        Ok(approval_id)
    }

    pub async fn get_approval(&self, approval_id: i64) -> Result<Option<ApprovalRequest>> {
        self.db.call(move |db| db.get_approval(approval_id)).await
    }

    pub async fn get_pending_approvals(&self, task_id: &str) -> Result<Vec<ApprovalRequest>> {
        let id = task_id.to_string();
        self.db
            .call(move |db| db.get_pending_approvals(&id, now_utc()))
            .await
    }

    /// Apply a decision to a pending approval; see
    /// [`WorkflowDb::decide_approval`].
    pub async fn decide_approval(&self, decision: GateDecision) -> Result<Option<Task>> {
        let approval_id = decision.approval_id;
        let status = decision.status;
        let task = self
            .db
            .call(move |db| db.decide_approval(&decision, now_utc()))
            .await?;
        if let Some(task) = &task {
            info!(
                approval_id,
                status = %status,
                task_id = %task.task_id,
                task_status = %task.status,
                "Approval decided"
            );
        }
        Ok(task)
    }

    pub async fn approval_history(&self, task_id: &str, limit: usize) -> Result<Vec<ApprovalRequest>> {
        let id = task_id.to_string();
        self.db.call(move |db| db.approval_history(&id, limit)).await
    }

    pub async fn approved_count(&self, task_id: &str) -> Result<i64> {
        let id = task_id.to_string();
        self.db.call(move |db| db.approved_count(&id)).await
    }

    pub async fn approval_stats_since(&self, cutoff: DateTime<Utc>) -> Result<ApprovalStats> {
        self.db
            .call(move |db| db.approval_stats_since(cutoff, now_utc()))
            .await
    }

    pub async fn record_quality_audit(
        &self,
        task_id: &str,
        phase: &str,
        approval_type: &str,
        quality_data: Value,
    ) -> Result<i64> {
        let (id, ph, kind) = (
            task_id.to_string(),
            phase.to_string(),
            approval_type.to_string(),
        );
        self.db
            .call(move |db| db.record_quality_audit(&id, &ph, &kind, &quality_data, now_utc()))
            .await
    }

    /// Expire overdue tasks and approvals. Returns the number of tasks expired;
    /// the approval count is logged.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        Ok(self.sweep(now_utc()).await?.expired_tasks)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = self.db.call(move |db| db.cleanup_expired(now)).await?;
        if report.expired_tasks > 0 || report.expired_approvals > 0 {
            warn!(
                expired_tasks = report.expired_tasks,
                expired_approvals = report.expired_approvals,
                "Expired items cleaned up"
            );
        }
        Ok(report)
    }
}
