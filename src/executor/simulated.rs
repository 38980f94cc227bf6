//! Deterministic research executor used when no real executor is wired in.
//!
//! Budget split: 40% market pass, the rest (at least 1000) for the technology
//! pass. The passes consume at most 2000 and 1800 tokens respectively.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use super::{ExecutorError, PhaseExecutor, PhaseInput, PhaseOutput};

const MARKET_SHARE: f64 = 0.4;
const MARKET_TOKEN_CAP: i64 = 2_000;
const TECH_TOKEN_CAP: i64 = 1_800;
const TECH_MIN_BUDGET: i64 = 1_000;
const MARKET_CONFIDENCE: f64 = 0.8;
const TECH_CONFIDENCE: f64 = 0.75;
const CONFIDENCE_CAP: f64 = 0.95;

struct PassResult {
    findings: Value,
    tokens_used: i64,
    confidence: f64,
    sources: Vec<&'static str>,
    best_practices: Vec<&'static str>,
}

pub struct SimulatedResearchExecutor {
    name: String,
    pass_delay: Duration,
}

impl Default for SimulatedResearchExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedResearchExecutor {
    pub fn new() -> Self {
        Self::named("research_agent")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pass_delay: Duration::from_millis(100),
        }
    }

    /// Simulated latency per research pass.
    pub fn with_pass_delay(self, pass_delay: Duration) -> Self {
        Self { pass_delay, ..self }
    }

    async fn market_pass(&self, description: &str, max_tokens: i64) -> PassResult {
        tokio::time::sleep(self.pass_delay).await;
        let lower = description.to_lowercase();
        let findings = if lower.contains("ecommerce") || lower.contains("store") {
            json!({
                "market_size": "$4.9 trillion global e-commerce market",
                "growth_rate": "14.7% CAGR",
                "key_trends": [
                    "Mobile commerce dominance",
                    "AI-powered personalization",
                    "Social commerce integration"
                ],
                "customer_expectations": [
                    "Fast loading times (<3 seconds)",
                    "Secure payment processing",
                    "Easy returns and refunds"
                ]
            })
        } else {
            json!({
                "market_overview": "General software market analysis",
                "key_trends": [
                    "Cloud-first architecture",
                    "API-driven development",
                    "User experience focus"
                ],
                "customer_needs": [
                    "Reliable performance",
                    "Intuitive user interface",
                    "Data security and privacy"
                ]
            })
        };
        PassResult {
            findings,
            tokens_used: max_tokens.min(MARKET_TOKEN_CAP),
            confidence: MARKET_CONFIDENCE,
            sources: vec![
                "https://example.com/market-report-1",
                "https://example.com/industry-analysis-2",
            ],
            best_practices: vec![
                "Follow industry security standards",
                "Implement scalable architecture patterns",
            ],
        }
    }

    async fn technology_pass(&self, max_tokens: i64) -> PassResult {
        tokio::time::sleep(self.pass_delay).await;
        PassResult {
            findings: json!({
                "recommended_stack": {
                    "backend": ["Rust axum", "Python FastAPI", "Java Spring"],
                    "database": ["PostgreSQL", "SQLite", "Redis"]
                },
                "architecture_patterns": [
                    "Modular monolith",
                    "Event-driven architecture"
                ],
                "security_considerations": [
                    "OAuth 2.0 / JWT authentication",
                    "Input validation and sanitization"
                ]
            }),
            tokens_used: max_tokens.min(TECH_TOKEN_CAP),
            confidence: TECH_CONFIDENCE,
            sources: vec![
                "https://example.com/tech-stack-guide",
                "https://example.com/architecture-patterns",
            ],
            best_practices: vec![
                "Implement proper monitoring and logging",
                "Follow REST API design principles",
            ],
        }
    }
}

#[async_trait]
impl PhaseExecutor for SimulatedResearchExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: &PhaseInput) -> Result<PhaseOutput, ExecutorError> {
        if input.token_budget <= 0 {
            return Err(ExecutorError::new(format!(
                "No token budget available (got {})",
                input.token_budget
            )));
        }
        let started = Instant::now();

        let market_budget = (input.token_budget as f64 * MARKET_SHARE) as i64;
        let market = self.market_pass(&input.description, market_budget).await;

        let tech_budget = (input.token_budget - market_budget).max(TECH_MIN_BUDGET);
        let tech = self.technology_pass(tech_budget).await;

        let tokens_used = market.tokens_used + tech.tokens_used;
        let confidence = (market.confidence * 0.5 + tech.confidence * 0.5).min(CONFIDENCE_CAP);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            executor = %self.name,
            task_id = %input.task_id,
            tokens_used,
            confidence,
            execution_time_ms = elapsed_ms,
            "Simulated research finished"
        );

        let sources: Vec<&str> = market.sources.iter().chain(&tech.sources).copied().collect();
        let best_practices: Vec<&str> = market
            .best_practices
            .iter()
            .chain(&tech.best_practices)
            .copied()
            .collect();

        let data = json!({
            "market_analysis": market.findings,
            "technology_landscape": tech.findings,
            "best_practices": best_practices,
            "source_confidence": confidence,
            "research_timestamp": input.timestamp,
            "source_urls": sources,
        });

        Ok(PhaseOutput::success(data, confidence, tokens_used)
            .with_execution_time(elapsed_ms)
            .with_recommendations(vec![
                format!("Review {} market analysis sources", market.sources.len()),
                format!("Validate {} technology recommendations", tech.sources.len()),
                format!(
                    "Consider budget allocation: used {}/{} tokens",
                    tokens_used, input.token_budget
                ),
            ]))
    }
}
