//! Per-task token budget: depth-tier templates, the atomic ledger, and the
//! diagnostic report.
//!
//! Scoring (diagnostics only, never enforcement):
//! - efficiency: 70% unspent share of the total + 30% phase balance, where
//!   balance penalises each phase's distance from 50% of its allocation
//! - utilisation: 1.0 inside 80-90% of the total, linear below, falling off
//!   above with a floor of 0.1

pub mod ledger;
pub mod templates;

use serde::{Deserialize, Serialize};

use crate::store::BudgetState;

pub use ledger::{BudgetLedger, MAX_TOKEN_AMOUNT};
pub use templates::{BudgetTemplate, template_for};

/// Per-phase usage ratio above which a phase is flagged.
const PHASE_USAGE_WARN: f64 = 0.9;

/// Overall consumption ratio above which the task is flagged.
const OVERALL_USAGE_WARN: f64 = 0.8;

/// Overall consumption ratio at which the overall flag turns critical.
const OVERALL_USAGE_CRITICAL: f64 = 0.95;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetHealth {
    Good,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recommendation {
    AllocationMismatch {
        allocated: i64,
        total_budget: i64,
        severity: Severity,
        message: String,
    },
    HighPhaseUsage {
        phase: String,
        usage_ratio: f64,
        severity: Severity,
        message: String,
    },
    HighOverallUsage {
        consumption_ratio: f64,
        severity: Severity,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetReport {
    pub task_id: String,
    pub total_budget: i64,
    pub consumed_tokens: i64,
    pub remaining_tokens: i64,
    pub budget_exceeded: bool,
    pub exceeded_phases: Vec<String>,
    pub budget_health: BudgetHealth,
    pub recommendations: Vec<Recommendation>,
    pub efficiency_score: f64,
    pub projected_overage: i64,
}

fn consumption_ratio(state: &BudgetState) -> f64 {
    if state.total_budget <= 0 {
        return 0.0;
    }
    state.consumed_tokens as f64 / state.total_budget as f64
}

/// Weighted efficiency in [0, 1]-ish; 0.0 for an empty budget.
pub fn efficiency_score(state: &BudgetState) -> f64 {
    if state.total_budget == 0 {
        return 0.0;
    }
    let consumption_efficiency = 1.0 - consumption_ratio(state);

    let phase_efficiency = if state.usage_by_phase.is_empty() {
        1.0
    } else {
        let variances: Vec<f64> = state
            .usage_by_phase
            .iter()
            .map(|(phase, used)| match state.phase_allocations.get(phase) {
                Some(&allocated) if allocated > 0 => (*used as f64 / allocated as f64 - 0.5).abs(),
                Some(_) => 0.0,
                // Unallocated phases are measured against a single token.
                None => (*used as f64 - 0.5).abs(),
            })
            .collect();
        1.0 - variances.iter().sum::<f64>() / variances.len() as f64
    };

    consumption_efficiency * 0.7 + phase_efficiency * 0.3
}

/// Score for how close final usage landed to the 80-90% target band.
pub fn utilisation_score(state: &BudgetState) -> f64 {
    if state.total_budget == 0 {
        return 0.0;
    }
    let u = consumption_ratio(state);
    if (0.8..=0.9).contains(&u) {
        1.0
    } else if u < 0.8 {
        u / 0.8
    } else {
        (1.0 - (u - 0.9) * 2.0).max(0.1)
    }
}

pub fn build_report(state: &BudgetState) -> BudgetReport {
    let mut recommendations = Vec::new();

    let allocated: i64 = state.phase_allocations.values().sum();
    if allocated != state.total_budget {
        recommendations.push(Recommendation::AllocationMismatch {
            allocated,
            total_budget: state.total_budget,
            severity: Severity::Warning,
            message: format!(
                "Phase allocations ({}) don't match total budget ({})",
                allocated, state.total_budget
            ),
        });
    }

    for (phase, used) in &state.usage_by_phase {
        let allocated = state.phase_allocation(phase);
        if allocated <= 0 {
            continue;
        }
        let usage_ratio = *used as f64 / allocated as f64;
        if usage_ratio > PHASE_USAGE_WARN {
            recommendations.push(Recommendation::HighPhaseUsage {
                phase: phase.clone(),
                usage_ratio,
                severity: if usage_ratio < 1.0 {
                    Severity::Warning
                } else {
                    Severity::Critical
                },
                message: format!(
                    "Phase '{}' using {:.1}% of allocation",
                    phase,
                    usage_ratio * 100.0
                ),
            });
        }
    }

    let ratio = consumption_ratio(state);
    if ratio > OVERALL_USAGE_WARN {
        recommendations.push(Recommendation::HighOverallUsage {
            consumption_ratio: ratio,
            severity: if ratio < OVERALL_USAGE_CRITICAL {
                Severity::Warning
            } else {
                Severity::Critical
            },
            message: format!("Overall budget {:.1}% consumed", ratio * 100.0),
        });
    }

    let budget_health = if ratio < 0.7 {
        BudgetHealth::Good
    } else if ratio < 0.9 {
        BudgetHealth::Warning
    } else {
        BudgetHealth::Critical
    };

    BudgetReport {
        task_id: state.task_id.clone(),
        total_budget: state.total_budget,
        consumed_tokens: state.consumed_tokens,
        remaining_tokens: state.remaining_tokens(),
        budget_exceeded: state.budget_exceeded,
        exceeded_phases: state.exceeded_phases.iter().cloned().collect(),
        budget_health,
        recommendations,
        efficiency_score: efficiency_score(state),
        projected_overage: (state.consumed_tokens - state.total_budget).max(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::now_utc;
    use phasegate_common::DepthTier;

    fn standard(task_id: &str) -> BudgetState {
        let (total, allocations) = template_for(DepthTier::Standard).resolve(None);
        BudgetState::new(task_id, total, allocations, now_utc())
    }

    #[test]
    fn test_efficiency_of_untouched_budget_is_one() {
        assert_eq!(efficiency_score(&standard("t")), 1.0);
    }

    #[test]
    fn test_efficiency_weighs_consumption_and_balance() {
        // research: 4000 / 8000 = exactly 50%, so balance is perfect.
        let state = standard("t").with_consumption("research", 4000, now_utc()).unwrap();
        let expected = (1.0 - 4000.0 / 25000.0) * 0.7 + 1.0 * 0.3;
        assert!((efficiency_score(&state) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_utilisation_band() {
        let base = standard("t");
        let at = |used: i64| utilisation_score(&base.with_consumption("research", used, now_utc()).unwrap());
        assert_eq!(at(21_000), 1.0);
        assert!((at(10_000) - 0.5).abs() < 1e-9);
        assert!((at(25_000) - 0.8).abs() < 1e-9);
        let over = BudgetState {
            consumed_tokens: 50_000,
            ..base.clone()
        };
        assert_eq!(utilisation_score(&over), 0.1);
    }

    #[test]
    fn test_report_flags_phase_overrun_as_critical() {
        let state = standard("t").with_consumption("research", 9000, now_utc()).unwrap();
        let report = build_report(&state);
        assert_eq!(report.budget_health, BudgetHealth::Good);
        assert_eq!(report.remaining_tokens, 16_000);
        assert_eq!(report.exceeded_phases, vec!["research".to_string()]);
        assert!(report.recommendations.iter().any(|r| matches!(
            r,
            Recommendation::HighPhaseUsage {
                severity: Severity::Critical,
                ..
            }
        )));
    }

    #[test]
    fn test_report_overall_usage_and_mismatch() {
        let state = standard("t")
            .with_additional(5_000, now_utc())
            .unwrap()
            .with_consumption("analysis", 28_000, now_utc())
            .unwrap();
        let report = build_report(&state);
        assert_eq!(report.budget_health, BudgetHealth::Critical);
        assert!(matches!(
            report.recommendations[0],
            Recommendation::AllocationMismatch { allocated: 25_000, total_budget: 30_000, .. }
        ));
        assert!(report.recommendations.iter().any(|r| matches!(
            r,
            Recommendation::HighOverallUsage {
                severity: Severity::Warning,
                ..
            }
        )));
        assert_eq!(report.projected_overage, 0);
    }

    #[test]
    fn test_recommendation_serializes_with_type_tag() {
        let rec = Recommendation::HighOverallUsage {
            consumption_ratio: 0.85,
            severity: Severity::Warning,
            message: "Overall budget 85.0% consumed".into(),
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["type"], "high_overall_usage");
        assert_eq!(json["severity"], "warning");
    }
}
