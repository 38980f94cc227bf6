//! The process-wide context: built once at startup and handed to the server,
//! the sweeper and CLI commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::breaker::BreakerRegistry;
use crate::budget::BudgetLedger;
use crate::config::PhasegateConfig;
use crate::executor::{ExecutorSet, SimulatedResearchExecutor};
use crate::orchestrator::WorkflowOrchestrator;
use crate::store::{DbHandle, TaskStore};

pub struct AppContext {
    pub config: PhasegateConfig,
    pub db: DbHandle,
    pub store: TaskStore,
    pub ledger: BudgetLedger,
    pub breakers: Arc<BreakerRegistry>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    /// Wire every component onto one database handle.
    pub fn new(config: PhasegateConfig, db: DbHandle, executors: ExecutorSet) -> Result<Self> {
        config.ensure_valid()?;
        let store = TaskStore::new(db.clone());
        let ledger = BudgetLedger::new(db.clone());
        let breakers = Arc::new(BreakerRegistry::new(db.clone(), config.breaker_config()));
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            store.clone(),
            ledger.clone(),
            Arc::clone(&breakers),
            executors,
            config.workflow_settings()?,
        ));
        Ok(Self {
            config,
            db,
            store,
            ledger,
            breakers,
            orchestrator,
            started_at: Utc::now(),
        })
    }

    /// Open the configured database with the default executors.
    pub fn open(config: PhasegateConfig) -> Result<Self> {
        let db = DbHandle::open(&config.database.path).with_context(|| {
            format!("Failed to open database at {}", config.database.path.display())
        })?;
        Self::new(config, db, default_executors())
    }

    /// In-memory database; used by tests.
    pub fn in_memory(config: PhasegateConfig, executors: ExecutorSet) -> Result<Self> {
        Self::new(config, DbHandle::in_memory()?, executors)
    }
}

/// The built-in simulated executor serves every phase.
pub fn default_executors() -> ExecutorSet {
    ExecutorSet::new().with_fallback(Arc::new(SimulatedResearchExecutor::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = PhasegateConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(AppContext::in_memory(config, default_executors()).is_err());
    }

    #[tokio::test]
    async fn test_components_share_one_database() -> Result<()> {
        let ctx = AppContext::in_memory(PhasegateConfig::default(), default_executors())?;
        ctx.store.ping().await?;
        ctx.breakers.get("research_agent").await?;
        assert_eq!(ctx.breakers.all_status().await?.len(), 1);
        assert!(default_executors().for_phase("anything").is_some());
        Ok(())
    }

    #[test]
    fn test_open_creates_database_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = PhasegateConfig::default();
        config.database.path = dir.path().join("nested").join("pg.db");
        AppContext::open(config)?;
        assert!(dir.path().join("nested").join("pg.db").exists());
        Ok(())
    }
}
