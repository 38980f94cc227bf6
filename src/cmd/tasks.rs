//! Database and task inspection commands — `phasegate init-db`, `sweep`,
//! `tasks` and `status`.

use std::str::FromStr;

use anyhow::{Context, Result};
use phasegate::config::PhasegateConfig;
use phasegate::context::AppContext;
use phasegate::store::{DbHandle, TaskStatus, now_utc};

pub fn cmd_init_db(config: &PhasegateConfig) -> Result<()> {
    let path = &config.database.path;
    let db = DbHandle::open(path)
        .with_context(|| format!("Failed to initialize database at {}", path.display()))?;
    db.lock_sync()?.ping()?;
    println!("Database initialized at {}", path.display());
    Ok(())
}

pub async fn cmd_sweep(config: PhasegateConfig) -> Result<()> {
    let ctx = AppContext::open(config)?;
    let report = ctx.store.sweep(now_utc()).await?;
    println!("Expired tasks: {}", report.expired_tasks);
    println!("Expired approvals: {}", report.expired_approvals);
    Ok(())
}

pub async fn cmd_tasks(config: PhasegateConfig, status: Option<&str>, limit: usize) -> Result<()> {
    let status = status
        .map(TaskStatus::from_str)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let ctx = AppContext::open(config)?;
    let tasks = ctx.store.list_tasks(status, limit.max(1)).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<18} {:<24} {:<8} {}",
        "TASK", "STATUS", "PROJECT", "PHASES", "CREATED"
    );
    for task in tasks {
        println!(
            "{:<38} {:<18} {:<24} {:<8} {}",
            task.task_id,
            task.status,
            truncate(&task.input.project_name, 24),
            task.phase_outputs.len(),
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

pub async fn cmd_status(config: PhasegateConfig, task_id: &str) -> Result<()> {
    let ctx = AppContext::open(config)?;
    let Some(status) = ctx.orchestrator.get_status(task_id).await? else {
        anyhow::bail!("Task not found: {}", task_id);
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}
