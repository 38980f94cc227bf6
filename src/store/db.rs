use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::warn;

use super::models::*;
use super::rows::*;
use crate::errors::StoreError;

/// Async-safe handle to the workflow database.
///
/// Wraps `WorkflowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. One closure holds the lock for
/// its whole body, so a read-check-write inside a single `call` is atomic
/// with respect to every other caller.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<WorkflowDb>>,
}

/// A closure that panicked mid-transaction has already rolled back when its
/// `Transaction` dropped, so the connection is safe to reuse.
fn recover(inner: &Mutex<WorkflowDb>) -> MutexGuard<'_, WorkflowDb> {
    inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
        warn!("DB lock was poisoned by a panicked caller; recovering");
        inner.clear_poison();
        poisoned.into_inner()
    })
}

impl DbHandle {
    pub fn new(db: WorkflowDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        Ok(Self::new(WorkflowDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(WorkflowDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&WorkflowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = recover(&db);
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For CLI commands and tests;
    /// never call from a hot async path.
    pub fn lock_sync(&self) -> Result<MutexGuard<'_, WorkflowDb>> {
        Ok(recover(&self.inner))
    }
}

pub struct WorkflowDb {
    conn: Connection,
}

impl WorkflowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS task_queue (
                    task_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    input TEXT NOT NULL,
                    phase_outputs TEXT NOT NULL DEFAULT '{}',
                    quality_scores TEXT NOT NULL DEFAULT '{}',
                    token_usage TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    expires_at TEXT,
                    error_message TEXT
                );

                CREATE TABLE IF NOT EXISTS approval_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL REFERENCES task_queue(task_id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    output TEXT NOT NULL,
                    recommendation TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    submitted_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    reviewed_at TEXT,
                    reviewer_feedback TEXT,
                    quality_score REAL
                );

                CREATE TABLE IF NOT EXISTS circuit_breaker_state (
                    name TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    success_count INTEGER NOT NULL DEFAULT 0,
                    last_failure_at TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS token_budgets (
                    task_id TEXT PRIMARY KEY REFERENCES task_queue(task_id) ON DELETE CASCADE,
                    total_budget INTEGER NOT NULL,
                    consumed_tokens INTEGER NOT NULL DEFAULT 0,
                    phase_allocations TEXT NOT NULL DEFAULT '{}',
                    usage_by_phase TEXT NOT NULL DEFAULT '{}',
                    budget_exceeded INTEGER NOT NULL DEFAULT 0,
                    exceeded_phases TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS quality_approvals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL REFERENCES task_queue(task_id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    approval_type TEXT NOT NULL,
                    quality_data TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_task_status ON task_queue(status);
                CREATE INDEX IF NOT EXISTS idx_task_created ON task_queue(created_at);
                CREATE INDEX IF NOT EXISTS idx_approval_task ON approval_requests(task_id);
                CREATE INDEX IF NOT EXISTS idx_approval_status ON approval_requests(status);
                CREATE INDEX IF NOT EXISTS idx_quality_task ON quality_approvals(task_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Run `f` inside one SQLite transaction. Any error rolls back every
    /// statement `f` issued.
    pub fn atomically<R>(&self, f: impl FnOnce(&WorkflowDb) -> Result<R>) -> Result<R> {
        // DbHandle's mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let out = f(self)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(out)
    }

    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Database ping failed")?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn enqueue_task(
        &self,
        task_id: &str,
        input: &TaskInput,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        if self.get_task(task_id)?.is_some() {
            return Err(StoreError::DuplicateTask {
                task_id: task_id.to_string(),
            }
            .into());
        }
        let ts = format_ts(&now);
        self.conn
            .execute(
                "INSERT INTO task_queue (task_id, status, input, created_at, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                params![
                    task_id,
                    TaskStatus::Pending.as_str(),
                    encode_json(input)?,
                    ts,
                    format_ts(&(now + ttl)),
                ],
            )
            .context("Failed to insert task")?;
        self.get_task(task_id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM task_queue WHERE task_id = ?1", TASK_COLUMNS),
                params![task_id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    fn require_task(&self, task_id: &str) -> Result<Task> {
        self.get_task(task_id)?.ok_or_else(|| {
            StoreError::TaskNotFound {
                task_id: task_id.to_string(),
            }
            .into()
        })
    }

    /// Move a task to `status`, optionally attaching one phase result.
    ///
    /// The transition is validated against the task state machine. Phase maps
    /// are merged insert-if-absent: an existing phase entry is never replaced.
    /// `error` overwrites the stored message (so `None` clears it).
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        record: Option<&PhaseRecord>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        self.atomically(|db| db.write_task_status(task_id, status, record, error, now))
    }

    /// `update_task_status` without its own transaction, for callers already
    /// inside `atomically`.
    fn write_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        record: Option<&PhaseRecord>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let current = self.require_task(task_id)?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                task_id: task_id.to_string(),
                from: current.status,
                to: status,
            }
            .into());
        }

        let mut outputs = current.phase_outputs;
        let mut quality = current.quality_scores;
        let mut usage = current.token_usage;
        if let Some(rec) = record {
            outputs
                .entry(rec.phase.clone())
                .or_insert_with(|| rec.output.clone());
            quality.entry(rec.phase.clone()).or_insert(rec.quality);
            usage.entry(rec.phase.clone()).or_insert(rec.tokens_used);
        }

        self.conn
            .execute(
                "UPDATE task_queue
                 SET status = ?2, phase_outputs = ?3, quality_scores = ?4, token_usage = ?5,
                     error_message = ?6, updated_at = ?7
                 WHERE task_id = ?1",
                params![
                    task_id,
                    status.as_str(),
                    encode_json(&outputs)?,
                    encode_json(&quality)?,
                    encode_json(&usage)?,
                    error,
                    format_ts(&now),
                ],
            )
            .context("Failed to update task status")?;
        self.require_task(task_id)
    }

    /// Tasks newest first, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let sql = match status {
            Some(_) => format!(
                "SELECT {} FROM task_queue WHERE status = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                TASK_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM task_queue ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                TASK_COLUMNS
            ),
        };
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_tasks")?;
        let limit = limit as i64;
        let rows = match status {
            Some(s) => stmt.query_map(params![s.as_str(), limit], TaskRow::from_row),
            None => stmt.query_map(params![limit], TaskRow::from_row),
        }
        .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            let r = row.context("Failed to read task row")?;
            tasks.push(r.into_task()?);
        }
        Ok(tasks)
    }

    /// Non-terminal tasks, oldest first.
    pub fn list_active_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM task_queue WHERE status IN (?1, ?2, ?3, ?4)
                 ORDER BY created_at, rowid LIMIT ?5",
                TASK_COLUMNS
            ))
            .context("Failed to prepare list_active_tasks")?;
        let [a, b, c, d] = TaskStatus::ACTIVE.map(|s| s.as_str());
        let rows = stmt
            .query_map(params![a, b, c, d, limit as i64], TaskRow::from_row)
            .context("Failed to query active tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            let r = row.context("Failed to read task row")?;
            tasks.push(r.into_task()?);
        }
        Ok(tasks)
    }

    /// Expire PENDING / AWAITING_APPROVAL tasks and PENDING approvals whose
    /// deadline is before `now`. Idempotent.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let ts = format_ts(&now);
        self.atomically(|db| {
            let expired_tasks = db
                .conn
                .execute(
                    "UPDATE task_queue SET status = 'expired', updated_at = ?1
                     WHERE status IN ('pending', 'awaiting_approval')
                       AND expires_at IS NOT NULL AND expires_at < ?1",
                    params![ts],
                )
                .context("Failed to expire tasks")?;
            let expired_approvals = db
                .conn
                .execute(
                    "UPDATE approval_requests SET status = 'expired'
                     WHERE status = 'pending' AND expires_at < ?1",
                    params![ts],
                )
                .context("Failed to expire approvals")?;
            Ok(SweepReport {
                expired_tasks,
                expired_approvals,
            })
        })
    }

    // ── Approval requests ─────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_approval_request(
        &self,
        task_id: &str,
        phase: &str,
        output: &Value,
        recommendation: &str,
        quality_score: Option<f64>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO approval_requests
                 (task_id, phase, output, recommendation, status, submitted_at, expires_at, quality_score)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
                params![
                    task_id,
                    phase,
                    encode_json(output)?,
                    recommendation,
                    format_ts(&now),
                    format_ts(&(now + ttl)),
                    quality_score,
                ],
            )
            .context("Failed to insert approval request")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_approval(&self, approval_id: i64) -> Result<Option<ApprovalRequest>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM approval_requests WHERE id = ?1",
                    APPROVAL_COLUMNS
                ),
                params![approval_id],
                ApprovalRow::from_row,
            )
            .optional()
            .context("Failed to query approval")?;
        row.map(ApprovalRow::into_approval).transpose()
    }

    /// Live PENDING approvals for a task, oldest first.
    pub fn get_pending_approvals(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM approval_requests
                 WHERE task_id = ?1 AND status = 'pending' AND expires_at > ?2
                 ORDER BY submitted_at, id",
                APPROVAL_COLUMNS
            ))
            .context("Failed to prepare get_pending_approvals")?;
        let rows = stmt
            .query_map(params![task_id, format_ts(&now)], ApprovalRow::from_row)
            .context("Failed to query pending approvals")?;
        let mut approvals = Vec::new();
        for row in rows {
            let r = row.context("Failed to read approval row")?;
            approvals.push(r.into_approval()?);
        }
        Ok(approvals)
    }

    /// Decide a PENDING approval. Returns false when the approval does not
    /// exist or was already decided; nothing is written in that case.
    pub fn update_approval_status(
        &self,
        approval_id: i64,
        status: ApprovalStatus,
        feedback: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE approval_requests
                 SET status = ?2, reviewed_at = ?3, reviewer_feedback = ?4
                 WHERE id = ?1 AND status = 'pending'",
                params![approval_id, status.as_str(), format_ts(&now), feedback],
            )
            .context("Failed to update approval status")?;
        Ok(changed > 0)
    }

    /// Apply `decision` to a PENDING approval: status, audit entry and task
    /// transition commit together or not at all. Returns `None` when the
    /// approval was already decided. An illegal task transition is an error
    /// and leaves the approval pending.
    pub fn decide_approval(&self, decision: &GateDecision, now: DateTime<Utc>) -> Result<Option<Task>> {
        self.atomically(|db| {
            let approval = db.get_approval(decision.approval_id)?.ok_or(
                StoreError::ApprovalNotFound {
                    approval_id: decision.approval_id,
                },
            )?;
            if approval.status != ApprovalStatus::Pending {
                return Ok(None);
            }
            db.update_approval_status(
                decision.approval_id,
                decision.status,
                decision.feedback.as_deref(),
                now,
            )?;
            db.record_quality_audit(
                &approval.task_id,
                &approval.phase,
                decision.audit_type,
                &decision.audit,
                now,
            )?;
            let task = match decision.task_status {
                Some(status) => db.write_task_status(
                    &approval.task_id,
                    status,
                    None,
                    decision.task_error.as_deref(),
                    now,
                )?,
                None => db.require_task(&approval.task_id)?,
            };
            Ok(Some(task))
        })
    }

    /// Decided approvals for a task, most recently reviewed first.
    pub fn approval_history(&self, task_id: &str, limit: usize) -> Result<Vec<ApprovalRequest>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM approval_requests
                 WHERE task_id = ?1 AND status != 'pending'
                 ORDER BY reviewed_at DESC, id DESC LIMIT ?2",
                APPROVAL_COLUMNS
            ))
            .context("Failed to prepare approval_history")?;
        let rows = stmt
            .query_map(params![task_id, limit as i64], ApprovalRow::from_row)
            .context("Failed to query approval history")?;
        let mut approvals = Vec::new();
        for row in rows {
            let r = row.context("Failed to read approval row")?;
            approvals.push(r.into_approval()?);
        }
        Ok(approvals)
    }

    pub fn approved_count(&self, task_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM approval_requests WHERE task_id = ?1 AND status = 'approved'",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to count approvals")
    }

    /// Counts over approvals submitted after `cutoff`.
    pub fn approval_stats_since(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalStats> {
        self.conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'approved' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'rejected' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'pending' AND expires_at < ?2 THEN 1 ELSE 0 END), 0)
                 FROM approval_requests WHERE submitted_at > ?1",
                params![format_ts(&cutoff), format_ts(&now)],
                |row| {
                    Ok(ApprovalStats {
                        pending_approvals: row.get(0)?,
                        approved_count: row.get(1)?,
                        rejected_count: row.get(2)?,
                        expired_pending: row.get(3)?,
                    })
                },
            )
            .context("Failed to compute approval stats")
    }

    // ── Quality audit log ─────────────────────────────────────────────

    pub fn record_quality_audit(
        &self,
        task_id: &str,
        phase: &str,
        approval_type: &str,
        quality_data: &Value,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO quality_approvals (task_id, phase, approval_type, quality_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task_id,
                    phase,
                    approval_type,
                    encode_json(quality_data)?,
                    format_ts(&now)
                ],
            )
            .context("Failed to insert quality audit")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_quality_audits(&self, task_id: &str) -> Result<Vec<QualityAudit>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM quality_approvals WHERE task_id = ?1 ORDER BY id",
                AUDIT_COLUMNS
            ))
            .context("Failed to prepare list_quality_audits")?;
        let rows = stmt
            .query_map(params![task_id], AuditRow::from_row)
            .context("Failed to query quality audits")?;
        let mut audits = Vec::new();
        for row in rows {
            let r = row.context("Failed to read audit row")?;
            audits.push(r.into_audit()?);
        }
        Ok(audits)
    }

    // ── Token budgets ─────────────────────────────────────────────────

    pub fn insert_budget(&self, budget: &BudgetState) -> Result<()> {
        let ts = format_ts(&budget.updated_at);
        self.conn
            .execute(
                "INSERT INTO token_budgets
                 (task_id, total_budget, consumed_tokens, phase_allocations, usage_by_phase,
                  budget_exceeded, exceeded_phases, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    budget.task_id,
                    budget.total_budget,
                    budget.consumed_tokens,
                    encode_json(&budget.phase_allocations)?,
                    encode_json(&budget.usage_by_phase)?,
                    budget.budget_exceeded,
                    encode_json(&budget.exceeded_phases)?,
                    ts,
                ],
            )
            .context("Failed to insert token budget")?;
        Ok(())
    }

    pub fn get_budget(&self, task_id: &str) -> Result<Option<BudgetState>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM token_budgets WHERE task_id = ?1",
                    BUDGET_COLUMNS
                ),
                params![task_id],
                BudgetRow::from_row,
            )
            .optional()
            .context("Failed to query token budget")?;
        row.map(BudgetRow::into_budget).transpose()
    }

    /// Overwrite the mutable columns of an existing budget row.
    pub fn save_budget(&self, budget: &BudgetState) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE token_budgets
                 SET total_budget = ?2, consumed_tokens = ?3, phase_allocations = ?4,
                     usage_by_phase = ?5, budget_exceeded = ?6, exceeded_phases = ?7,
                     updated_at = ?8
                 WHERE task_id = ?1",
                params![
                    budget.task_id,
                    budget.total_budget,
                    budget.consumed_tokens,
                    encode_json(&budget.phase_allocations)?,
                    encode_json(&budget.usage_by_phase)?,
                    budget.budget_exceeded,
                    encode_json(&budget.exceeded_phases)?,
                    format_ts(&budget.updated_at),
                ],
            )
            .context("Failed to update token budget")?;
        if changed == 0 {
            anyhow::bail!("No budget row for task {}", budget.task_id);
        }
        Ok(())
    }

    // ── Circuit breaker state ─────────────────────────────────────────

    pub fn load_breaker(&self, name: &str) -> Result<Option<BreakerRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM circuit_breaker_state WHERE name = ?1",
                    BREAKER_COLUMNS
                ),
                params![name],
                BreakerRow::from_row,
            )
            .optional()
            .context("Failed to query breaker state")?;
        row.map(BreakerRow::into_record).transpose()
    }

    pub fn upsert_breaker(&self, record: &BreakerRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO circuit_breaker_state
                 (name, state, failure_count, success_count, last_failure_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(name) DO UPDATE SET
                    state = excluded.state,
                    failure_count = excluded.failure_count,
                    success_count = excluded.success_count,
                    last_failure_at = excluded.last_failure_at,
                    updated_at = excluded.updated_at",
                params![
                    record.name,
                    record.state.as_str(),
                    record.failure_count,
                    record.success_count,
                    record.last_failure_at.as_ref().map(format_ts),
                    format_ts(&record.updated_at),
                ],
            )
            .context("Failed to upsert breaker state")?;
        Ok(())
    }

    pub fn list_breakers(&self) -> Result<Vec<BreakerRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM circuit_breaker_state ORDER BY name",
                BREAKER_COLUMNS
            ))
            .context("Failed to prepare list_breakers")?;
        let rows = stmt
            .query_map([], BreakerRow::from_row)
            .context("Failed to query breakers")?;
        let mut records = Vec::new();
        for row in rows {
            let r = row.context("Failed to read breaker row")?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use phasegate_common::DepthTier;
    use serde_json::json;

    fn input() -> TaskInput {
        TaskInput::new("atlas", "Trail mapping for hikers", DepthTier::Standard)
    }

    fn hours(h: i64) -> Duration {
        Duration::hours(h)
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('task_queue', 'approval_requests', 'circuit_breaker_state', 'token_budgets', 'quality_approvals')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5, "Expected 5 tables to exist");

        // Running migrations twice is harmless.
        db.run_migrations()?;
        db.ping()?;
        Ok(())
    }

    #[test]
    fn test_enqueue_task() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        let task = db.enqueue_task("t-1", &input(), hours(48), now)?;

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.input, input());
        assert_eq!(task.created_at, now);
        assert_eq!(task.expires_at, Some(now + hours(48)));
        assert!(task.phase_outputs.is_empty());
        assert!(task.error_message.is_none());
        Ok(())
    }

    #[test]
    fn test_enqueue_duplicate_is_rejected() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        db.enqueue_task("t-1", &input(), hours(48), now_utc())?;
        let err = db
            .enqueue_task("t-1", &input(), hours(48), now_utc())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DuplicateTask { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_get_missing_task_is_none() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        assert!(db.get_task("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_status_merges_phase_output_additively() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), now)?;
        db.update_task_status("t-1", TaskStatus::Running, None, None, now)?;

        let first = PhaseRecord {
            phase: "research".into(),
            output: json!({"findings": ["a"]}),
            quality: 0.8,
            tokens_used: 1200,
        };
        db.update_task_status("t-1", TaskStatus::Running, Some(&first), None, now)?;

        // A second record for the same phase must not overwrite the first.
        let second = PhaseRecord {
            phase: "research".into(),
            output: json!({"findings": ["b"]}),
            quality: 0.1,
            tokens_used: 9,
        };
        let analysis = PhaseRecord {
            phase: "analysis".into(),
            output: json!({"score": 3}),
            quality: 0.6,
            tokens_used: 300,
        };
        db.update_task_status("t-1", TaskStatus::Running, Some(&second), None, now)?;
        let task = db.update_task_status("t-1", TaskStatus::Running, Some(&analysis), None, now)?;

        assert_eq!(task.phase_outputs["research"], json!({"findings": ["a"]}));
        assert_eq!(task.quality_scores["research"], 0.8);
        assert_eq!(task.token_usage["research"], 1200);
        assert_eq!(task.token_usage["analysis"], 300);
        assert_eq!(task.phase_outputs.len(), 2);
        Ok(())
    }

    #[test]
    fn test_update_status_rejects_illegal_transition() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), now)?;
        let err = db
            .update_task_status("t-1", TaskStatus::Completed, None, None, now)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::IllegalTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed,
                ..
            })
        ));
        // Nothing was written.
        assert_eq!(db.get_task("t-1")?.unwrap().status, TaskStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_update_status_on_missing_task() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let err = db
            .update_task_status("ghost", TaskStatus::Running, None, None, now_utc())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::TaskNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_failed_status_records_error_message() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), now)?;
        let task = db.update_task_status(
            "t-1",
            TaskStatus::Failed,
            None,
            Some("Phase 'research' failed: boom"),
            now,
        )?;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some("Phase 'research' failed: boom")
        );
        Ok(())
    }

    #[test]
    fn test_list_tasks_newest_first_with_filter() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let t0 = now_utc();
        db.enqueue_task("old", &input(), hours(48), t0)?;
        db.enqueue_task("mid", &input(), hours(48), t0 + Duration::seconds(1))?;
        db.enqueue_task("new", &input(), hours(48), t0 + Duration::seconds(2))?;
        db.update_task_status("mid", TaskStatus::Running, None, None, t0)?;

        let all = db.list_tasks(None, 10)?;
        let ids: Vec<&str> = all.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);

        let running = db.list_tasks(Some(TaskStatus::Running), 10)?;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, "mid");

        assert_eq!(db.list_tasks(None, 2)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_cleanup_expired_moves_overdue_tasks_and_approvals() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let t0 = now_utc();
        db.enqueue_task("stale", &input(), hours(1), t0)?;
        db.enqueue_task("fresh", &input(), hours(48), t0)?;
        db.enqueue_task("busy", &input(), hours(1), t0)?;
        db.update_task_status("busy", TaskStatus::Running, None, None, t0)?;
        let approval =
            db.create_approval_request("fresh", "research", &json!({}), "review", None, hours(1), t0)?;

        let later = t0 + hours(2);
        let report = db.cleanup_expired(later)?;
        assert_eq!(
            report,
            SweepReport {
                expired_tasks: 1,
                expired_approvals: 1
            }
        );
        assert_eq!(db.get_task("stale")?.unwrap().status, TaskStatus::Expired);
        assert_eq!(db.get_task("fresh")?.unwrap().status, TaskStatus::Pending);
        // RUNNING tasks are never expired by the sweep.
        assert_eq!(db.get_task("busy")?.unwrap().status, TaskStatus::Running);
        assert_eq!(
            db.get_approval(approval)?.unwrap().status,
            ApprovalStatus::Expired
        );

        let active: Vec<String> = db
            .list_active_tasks(10)?
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert!(!active.contains(&"stale".to_string()));

        // Second sweep finds nothing.
        assert_eq!(db.cleanup_expired(later)?, SweepReport::default());
        Ok(())
    }

    #[test]
    fn test_pending_approvals_oldest_first_and_live_only() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let t0 = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), t0)?;
        let a = db.create_approval_request("t-1", "research", &json!({"n": 1}), "r", Some(0.7), hours(24), t0)?;
        let b = db.create_approval_request(
            "t-1",
            "analysis",
            &json!({"n": 2}),
            "r",
            None,
            hours(24),
            t0 + Duration::seconds(5),
        )?;
        db.create_approval_request("t-1", "old", &json!({}), "r", None, hours(1), t0)?;

        let pending = db.get_pending_approvals("t-1", t0 + hours(2))?;
        let ids: Vec<i64> = pending.iter().map(|p| p.approval_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(pending[0].output, json!({"n": 1}));
        assert_eq!(pending[0].quality_score, Some(0.7));
        Ok(())
    }

    #[test]
    fn test_update_approval_status_is_conditional() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let t0 = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), t0)?;
        let id = db.create_approval_request("t-1", "research", &json!({}), "r", None, hours(24), t0)?;

        let first_at = t0 + Duration::minutes(5);
        assert!(db.update_approval_status(id, ApprovalStatus::Approved, Some("ok"), first_at)?);
        assert!(!db.update_approval_status(
            id,
            ApprovalStatus::Rejected,
            Some("changed my mind"),
            t0 + Duration::minutes(9)
        )?);

        let approval = db.get_approval(id)?.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert_eq!(approval.reviewed_at, Some(first_at));
        assert_eq!(approval.reviewer_feedback.as_deref(), Some("ok"));

        assert!(!db.update_approval_status(9999, ApprovalStatus::Approved, None, t0)?);
        assert_eq!(db.approved_count("t-1")?, 1);
        Ok(())
    }

    #[test]
    fn test_approval_history_and_stats() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let t0 = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), t0)?;
        let a = db.create_approval_request("t-1", "research", &json!({}), "r", None, hours(24), t0)?;
        let b = db.create_approval_request("t-1", "analysis", &json!({}), "r", None, hours(24), t0)?;
        db.create_approval_request("t-1", "synthesis", &json!({}), "r", None, hours(1), t0)?;
        db.update_approval_status(a, ApprovalStatus::Approved, None, t0 + Duration::minutes(1))?;
        db.update_approval_status(b, ApprovalStatus::Rejected, Some("thin"), t0 + Duration::minutes(2))?;

        let history = db.approval_history("t-1", 10)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].approval_id, b);
        assert_eq!(history[1].approval_id, a);

        let stats = db.approval_stats_since(t0 - hours(24), t0 + hours(2))?;
        assert_eq!(
            stats,
            ApprovalStats {
                pending_approvals: 1,
                approved_count: 1,
                rejected_count: 1,
                expired_pending: 1,
            }
        );
        Ok(())
    }

    #[test]
    fn test_quality_audit_round_trip() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), now)?;
        let data = json!({"approved": true, "modifications": {"focus": "pricing"}});
        db.record_quality_audit("t-1", "research", "human", &data, now)?;

        let audits = db.list_quality_audits("t-1")?;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].quality_data, data);
        assert_eq!(audits[0].approval_type, "human");
        Ok(())
    }

    #[test]
    fn test_budget_insert_and_save() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), now)?;
        let allocations = [("research".to_string(), 8000)].into_iter().collect();
        let budget = BudgetState::new("t-1", 25000, allocations, now);
        db.insert_budget(&budget)?;
        assert_eq!(db.get_budget("t-1")?, Some(budget.clone()));

        let next = budget.with_consumption("research", 9000, now).unwrap();
        db.save_budget(&next)?;
        let stored = db.get_budget("t-1")?.unwrap();
        assert_eq!(stored.consumed_tokens, 9000);
        assert!(stored.exceeded_phases.contains("research"));
        Ok(())
    }

    #[test]
    fn test_budget_requires_existing_task() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let budget = BudgetState::new("ghost", 100, Default::default(), now_utc());
        assert!(db.insert_budget(&budget).is_err());
        Ok(())
    }

    #[test]
    fn test_breaker_upsert_round_trip() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        assert!(db.load_breaker("research_agent")?.is_none());

        let mut record = BreakerRecord::closed("research_agent", now);
        db.upsert_breaker(&record)?;
        record.state = CircuitState::Open;
        record.failure_count = 3;
        record.last_failure_at = Some(now);
        db.upsert_breaker(&record)?;

        assert_eq!(db.load_breaker("research_agent")?, Some(record));
        assert_eq!(db.list_breakers()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_atomically_rolls_back_on_error() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        let result: Result<()> = db.atomically(|db| {
            db.enqueue_task("t-1", &input(), hours(48), now)?;
            anyhow::bail!("abort")
        });
        assert!(result.is_err());
        assert!(db.get_task("t-1")?.is_none());
        Ok(())
    }

    fn rejection(approval_id: i64) -> GateDecision {
        GateDecision {
            approval_id,
            status: ApprovalStatus::Rejected,
            feedback: Some("wrong market".into()),
            audit_type: "human_review",
            audit: json!({ "approval_id": approval_id }),
            task_status: Some(TaskStatus::Failed),
            task_error: Some("rejected".into()),
        }
    }

    #[test]
    fn test_decide_approval_writes_all_three() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), now)?;
        db.update_task_status("t-1", TaskStatus::Running, None, None, now)?;
        db.update_task_status("t-1", TaskStatus::AwaitingApproval, None, None, now)?;
        let id = db.create_approval_request("t-1", "research", &json!({}), "r", None, hours(24), now)?;

        let task = db.decide_approval(&rejection(id), now)?.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("rejected"));
        assert_eq!(db.get_approval(id)?.unwrap().status, ApprovalStatus::Rejected);
        assert_eq!(db.list_quality_audits("t-1")?.len(), 1);

        // Already decided: nothing further is written.
        assert!(db.decide_approval(&rejection(id), now)?.is_none());
        assert_eq!(db.list_quality_audits("t-1")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_decide_approval_is_all_or_nothing() -> Result<()> {
        let db = WorkflowDb::new_in_memory()?;
        let now = now_utc();
        db.enqueue_task("t-1", &input(), hours(48), now)?;
        db.update_task_status("t-1", TaskStatus::Running, None, None, now)?;
        let id = db.create_approval_request("t-1", "research", &json!({}), "r", None, hours(24), now)?;
        db.update_task_status("t-1", TaskStatus::Failed, None, Some("boom"), now)?;

        let approve = GateDecision {
            status: ApprovalStatus::Approved,
            task_status: Some(TaskStatus::Approved),
            task_error: None,
            ..rejection(id)
        };
        let err = db.decide_approval(&approve, now).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::IllegalTransition { .. })
        ));

        let approval = db.get_approval(id)?.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert!(approval.reviewed_at.is_none());
        assert!(db.list_quality_audits("t-1")?.is_empty());
        assert_eq!(db.get_task("t-1")?.unwrap().status, TaskStatus::Failed);

        let err = db.decide_approval(&rejection(999), now).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ApprovalNotFound { approval_id: 999 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_call_runs_closure() -> Result<()> {
        let handle = DbHandle::in_memory()?;
        let task = handle
            .call(|db| db.enqueue_task("t-1", &input(), hours(48), now_utc()))
            .await?;
        assert_eq!(task.task_id, "t-1");
        let fetched = handle.call(|db| db.get_task("t-1")).await?;
        assert!(fetched.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_survives_panicking_closure() -> Result<()> {
        let handle = DbHandle::in_memory()?;
        let panicked = handle
            .call(|db| {
                db.atomically(|db| {
                    db.enqueue_task("t-1", &input(), hours(48), now_utc())?;
                    if db.get_task("t-1")?.is_some() {
                        panic!("closure blew up mid-transaction");
                    }
                    Ok(())
                })
            })
            .await;
        assert!(panicked.is_err());

        // The half-written transaction rolled back and later calls still work.
        assert!(handle.call(|db| db.get_task("t-1")).await?.is_none());
        handle
            .call(|db| db.enqueue_task("t-2", &input(), hours(48), now_utc()))
            .await?;
        assert!(handle.lock_sync()?.get_task("t-2")?.is_some());
        Ok(())
    }
}
