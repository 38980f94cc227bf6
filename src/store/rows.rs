//! Typed row codecs. Every persisted entity has one raw row struct read
//! straight from SQLite and one `into_*` conversion that parses enums,
//! timestamps and JSON columns. Encoding goes through `encode_json` and
//! `format_ts` so both directions share one format.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::Row;
use serde::Serialize;

use super::models::*;

/// Fixed-width UTC timestamps: lexical order matches time order.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", raw))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Current time at the precision the store keeps.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON column")
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str, what: &str) -> Result<T> {
    T::from_str(raw)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

// ── task_queue ────────────────────────────────────────────────────────

pub const TASK_COLUMNS: &str = "task_id, status, input, phase_outputs, quality_scores, token_usage, created_at, updated_at, expires_at, error_message";

pub struct TaskRow {
    task_id: String,
    status: String,
    input: String,
    phase_outputs: String,
    quality_scores: String,
    token_usage: String,
    created_at: String,
    updated_at: String,
    expires_at: Option<String>,
    error_message: Option<String>,
}

impl TaskRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            status: row.get(1)?,
            input: row.get(2)?,
            phase_outputs: row.get(3)?,
            quality_scores: row.get(4)?,
            token_usage: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            expires_at: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    pub fn into_task(self) -> Result<Task> {
        let status = parse_enum(&self.status, "task status")?;
        let input: TaskInput =
            serde_json::from_str(&self.input).context("Failed to parse task input JSON")?;
        let phase_outputs = serde_json::from_str(&self.phase_outputs)
            .context("Failed to parse phase outputs JSON")?;
        let quality_scores = serde_json::from_str(&self.quality_scores)
            .context("Failed to parse quality scores JSON")?;
        let token_usage =
            serde_json::from_str(&self.token_usage).context("Failed to parse token usage JSON")?;

        Ok(Task {
            task_id: self.task_id,
            status,
            input,
            phase_outputs,
            quality_scores,
            token_usage,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            expires_at: parse_opt_ts(self.expires_at)?,
            error_message: self.error_message,
        })
    }
}

// ── approval_requests ─────────────────────────────────────────────────

pub const APPROVAL_COLUMNS: &str = "id, task_id, phase, output, recommendation, status, submitted_at, expires_at, reviewed_at, reviewer_feedback, quality_score";

pub struct ApprovalRow {
    id: i64,
    task_id: String,
    phase: String,
    output: String,
    recommendation: String,
    status: String,
    submitted_at: String,
    expires_at: String,
    reviewed_at: Option<String>,
    reviewer_feedback: Option<String>,
    quality_score: Option<f64>,
}

impl ApprovalRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            phase: row.get(2)?,
            output: row.get(3)?,
            recommendation: row.get(4)?,
            status: row.get(5)?,
            submitted_at: row.get(6)?,
            expires_at: row.get(7)?,
            reviewed_at: row.get(8)?,
            reviewer_feedback: row.get(9)?,
            quality_score: row.get(10)?,
        })
    }

    pub fn into_approval(self) -> Result<ApprovalRequest> {
        Ok(ApprovalRequest {
            approval_id: self.id,
            task_id: self.task_id,
            phase: self.phase,
            output: serde_json::from_str(&self.output)
                .context("Failed to parse approval output JSON")?,
            recommendation: self.recommendation,
            status: parse_enum(&self.status, "approval status")?,
            submitted_at: parse_ts(&self.submitted_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            reviewed_at: parse_opt_ts(self.reviewed_at)?,
            reviewer_feedback: self.reviewer_feedback,
            quality_score: self.quality_score,
        })
    }
}

// ── token_budgets ─────────────────────────────────────────────────────

pub const BUDGET_COLUMNS: &str = "task_id, total_budget, consumed_tokens, phase_allocations, usage_by_phase, budget_exceeded, exceeded_phases, updated_at";

pub struct BudgetRow {
    task_id: String,
    total_budget: i64,
    consumed_tokens: i64,
    phase_allocations: String,
    usage_by_phase: String,
    budget_exceeded: bool,
    exceeded_phases: String,
    updated_at: String,
}

impl BudgetRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            total_budget: row.get(1)?,
            consumed_tokens: row.get(2)?,
            phase_allocations: row.get(3)?,
            usage_by_phase: row.get(4)?,
            budget_exceeded: row.get(5)?,
            exceeded_phases: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    pub fn into_budget(self) -> Result<BudgetState> {
        let phase_allocations: BTreeMap<String, i64> =
            serde_json::from_str(&self.phase_allocations)
                .context("Failed to parse phase allocations JSON")?;
        let usage_by_phase: BTreeMap<String, i64> = serde_json::from_str(&self.usage_by_phase)
            .context("Failed to parse phase usage JSON")?;
        let exceeded_phases: BTreeSet<String> = serde_json::from_str(&self.exceeded_phases)
            .context("Failed to parse exceeded phases JSON")?;

        Ok(BudgetState {
            task_id: self.task_id,
            total_budget: self.total_budget,
            consumed_tokens: self.consumed_tokens,
            phase_allocations,
            usage_by_phase,
            budget_exceeded: self.budget_exceeded,
            exceeded_phases,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

// ── circuit_breaker_state ─────────────────────────────────────────────

pub const BREAKER_COLUMNS: &str =
    "name, state, failure_count, success_count, last_failure_at, updated_at";

pub struct BreakerRow {
    name: String,
    state: String,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<String>,
    updated_at: String,
}

impl BreakerRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            state: row.get(1)?,
            failure_count: row.get(2)?,
            success_count: row.get(3)?,
            last_failure_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    pub fn into_record(self) -> Result<BreakerRecord> {
        Ok(BreakerRecord {
            state: parse_enum(&self.state, "circuit state")?,
            name: self.name,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_at: parse_opt_ts(self.last_failure_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

// ── quality_approvals ─────────────────────────────────────────────────

pub const AUDIT_COLUMNS: &str = "id, task_id, phase, approval_type, quality_data, created_at";

pub struct AuditRow {
    id: i64,
    task_id: String,
    phase: String,
    approval_type: String,
    quality_data: String,
    created_at: String,
}

impl AuditRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            phase: row.get(2)?,
            approval_type: row.get(3)?,
            quality_data: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    pub fn into_audit(self) -> Result<QualityAudit> {
        Ok(QualityAudit {
            id: self.id,
            task_id: self.task_id,
            phase: self.phase,
            approval_type: self.approval_type,
            quality_data: serde_json::from_str(&self.quality_data)
                .context("Failed to parse quality data JSON")?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let (fa, fb) = (format_ts(&a), format_ts(&b));
        assert_eq!(fa, "2026-03-01T09:05:00.000000Z");
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = now_utc();
        assert_eq!(parse_ts(&format_ts(&now)).unwrap(), now);
    }

    #[test]
    fn test_parse_ts_rejects_garbage() {
        let err = parse_ts("yesterday").unwrap_err();
        assert!(format!("{:#}", err).contains("yesterday"));
    }
}
