use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::depth::DepthTier;

/// Everything a phase executor is given for one call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseInput {
    pub task_id: String,
    pub phase: String,
    pub project_name: String,
    pub description: String,
    pub depth: DepthTier,
    /// Hard ceiling on tokens the executor may spend.
    pub token_budget: i64,
    /// Outputs of earlier phases plus any reviewer modifications.
    pub context_data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Result reported by an executor. Values are never mutated in place; the
/// `with_*` helpers build a new output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutput {
    pub success: bool,
    pub data: Value,
    pub confidence: f64,
    pub tokens_used: i64,
    pub execution_time_ms: u64,
    pub error_message: Option<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl PhaseOutput {
    pub fn success(data: Value, confidence: f64, tokens_used: i64) -> Self {
        Self {
            success: true,
            data,
            confidence: confidence.clamp(0.0, 1.0),
            tokens_used,
            execution_time_ms: 0,
            error_message: None,
            recommendations: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>, tokens_used: i64) -> Self {
        Self {
            success: false,
            data: Value::Object(Default::default()),
            confidence: 0.0,
            tokens_used,
            execution_time_ms: 0,
            error_message: Some(message.into()),
            recommendations: Vec::new(),
        }
    }

    /// Whether `confidence` is a real number in `[0, 1]`. A NaN passes
    /// through `success`'s clamp unchanged and fails here.
    pub fn confidence_in_range(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }

    pub fn with_execution_time(self, execution_time_ms: u64) -> Self {
        Self {
            execution_time_ms,
            ..self
        }
    }

    pub fn with_recommendations(self, recommendations: Vec<String>) -> Self {
        Self {
            recommendations,
            ..self
        }
    }
}

/// Raw failure raised by an executor. Circuit breakers count these before the
/// orchestrator turns them into a failed [`PhaseOutput`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
    /// Best-effort count of tokens spent before the failure.
    pub tokens_attempted: i64,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tokens_attempted: 0,
        }
    }

    pub fn with_tokens(message: impl Into<String>, tokens_attempted: i64) -> Self {
        Self {
            message: message.into(),
            tokens_attempted,
        }
    }
}

/// A unit of phase work. Implementations must be cheap to share across tasks.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Name used to key the circuit breaker guarding this executor.
    fn name(&self) -> &str;

    async fn execute(&self, input: &PhaseInput) -> Result<PhaseOutput, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl PhaseExecutor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, input: &PhaseInput) -> Result<PhaseOutput, ExecutorError> {
            if input.token_budget <= 0 {
                return Err(ExecutorError::new("no budget"));
            }
            Ok(PhaseOutput::success(
                json!({"description": input.description}),
                0.9,
                input.token_budget / 2,
            ))
        }
    }

    fn input(budget: i64) -> PhaseInput {
        PhaseInput {
            task_id: "t-1".into(),
            phase: "research".into(),
            project_name: "demo".into(),
            description: "a description".into(),
            depth: DepthTier::Quick,
            token_budget: budget,
            context_data: json!({}),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_success_output_clamps_confidence() {
        let out = PhaseOutput::success(json!({}), 1.7, 10);
        assert_eq!(out.confidence, 1.0);
        assert!(out.confidence_in_range());
        assert!(out.success);
        assert!(out.error_message.is_none());
    }

    #[test]
    fn test_nan_confidence_is_out_of_range() {
        assert!(!PhaseOutput::success(json!({}), f64::NAN, 10).confidence_in_range());
        let hand_built = PhaseOutput {
            confidence: -0.5,
            ..PhaseOutput::success(json!({}), 0.5, 10)
        };
        assert!(!hand_built.confidence_in_range());
    }

    #[test]
    fn test_failure_output_shape() {
        let out = PhaseOutput::failure("boom", 42).with_execution_time(15);
        assert!(!out.success);
        assert_eq!(out.error_message.as_deref(), Some("boom"));
        assert_eq!(out.tokens_used, 42);
        assert_eq!(out.execution_time_ms, 15);
    }

    #[tokio::test]
    async fn test_executor_trait_object() {
        let exec: Box<dyn PhaseExecutor> = Box::new(Echo);
        let out = exec.execute(&input(1000)).await.unwrap();
        assert_eq!(out.tokens_used, 500);
        assert_eq!(exec.name(), "echo");

        let err = exec.execute(&input(0)).await.unwrap_err();
        assert_eq!(err.to_string(), "no budget");
    }
}
