//! Depth-tier budget templates.
//!
//! | Tier          | Total  | research | analysis | questions | architecture | documentation | validation | reserve |
//! |---------------|--------|----------|----------|-----------|--------------|---------------|------------|---------|
//! | quick         | 10000  | 3000     | 2500     | 2000      | 2000         | -             | -          | 500     |
//! | standard      | 25000  | 8000     | 6000     | 4000      | 5000         | 1500          | -          | 500     |
//! | comprehensive | 50000  | 15000    | 12000    | 8000      | 10000        | 4000          | 1000       | -       |

use std::collections::BTreeMap;

use phasegate_common::DepthTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetTemplate {
    pub depth: DepthTier,
    pub total: i64,
    pub allocations: &'static [(&'static str, i64)],
}

const QUICK: BudgetTemplate = BudgetTemplate {
    depth: DepthTier::Quick,
    total: 10_000,
    allocations: &[
        ("research", 3_000),
        ("analysis", 2_500),
        ("questions", 2_000),
        ("architecture", 2_000),
        ("reserve", 500),
    ],
};

const STANDARD: BudgetTemplate = BudgetTemplate {
    depth: DepthTier::Standard,
    total: 25_000,
    allocations: &[
        ("research", 8_000),
        ("analysis", 6_000),
        ("questions", 4_000),
        ("architecture", 5_000),
        ("documentation", 1_500),
        ("reserve", 500),
    ],
};

const COMPREHENSIVE: BudgetTemplate = BudgetTemplate {
    depth: DepthTier::Comprehensive,
    total: 50_000,
    allocations: &[
        ("research", 15_000),
        ("analysis", 12_000),
        ("questions", 8_000),
        ("architecture", 10_000),
        ("documentation", 4_000),
        ("validation", 1_000),
    ],
};

pub fn template_for(depth: DepthTier) -> &'static BudgetTemplate {
    match depth {
        DepthTier::Quick => &QUICK,
        DepthTier::Standard => &STANDARD,
        DepthTier::Comprehensive => &COMPREHENSIVE,
    }
}

impl BudgetTemplate {
    pub fn allocation_map(&self) -> BTreeMap<String, i64> {
        self.allocations
            .iter()
            .map(|(phase, tokens)| (phase.to_string(), *tokens))
            .collect()
    }

    /// Total and per-phase allocations, scaled to `custom_total` when given.
    /// Each allocation is truncated, so the scaled sum may fall short of
    /// `custom_total` by a few tokens but never exceeds it.
    pub fn resolve(&self, custom_total: Option<i64>) -> (i64, BTreeMap<String, i64>) {
        match custom_total {
            None => (self.total, self.allocation_map()),
            Some(custom) => {
                let scaled = self
                    .allocations
                    .iter()
                    .map(|(phase, tokens)| (phase.to_string(), tokens * custom / self.total))
                    .collect();
                (custom, scaled)
            }
        }
    }
}
