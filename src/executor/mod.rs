//! Phase executors: the set the orchestrator dispatches to, and the built-in
//! simulated research executor.

pub mod simulated;

use std::collections::HashMap;
use std::sync::Arc;

pub use phasegate_common::{ExecutorError, PhaseExecutor, PhaseInput, PhaseOutput};
pub use simulated::SimulatedResearchExecutor;

/// Executors keyed by phase name, with an optional fallback for phases that
/// have no dedicated executor.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    by_phase: HashMap<String, Arc<dyn PhaseExecutor>>,
    fallback: Option<Arc<dyn PhaseExecutor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_phase(mut self, phase: &str, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.by_phase.insert(phase.to_string(), executor);
        self
    }

    pub fn with_fallback(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn for_phase(&self, phase: &str) -> Option<Arc<dyn PhaseExecutor>> {
        self.by_phase
            .get(phase)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}
