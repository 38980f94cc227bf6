use phasegate_common::DepthTier;
use tracing::{debug, info, warn};

use super::{BudgetReport, build_report, templates::template_for};
use crate::errors::BudgetError;
use crate::store::{BudgetState, DbHandle, now_utc};

/// Convert a storage-closure error back into a `BudgetError` when the closure
/// raised one.
fn lift(err: anyhow::Error) -> BudgetError {
    match err.downcast::<BudgetError>() {
        Ok(budget) => budget,
        Err(other) => BudgetError::Storage(other),
    }
}

fn overflow(amount: i64) -> anyhow::Error {
    BudgetError::InvalidAmount {
        amount,
        reason: "would overflow the token counters",
    }
    .into()
}

/// Largest amount a single consume or emergency allocation may carry.
pub const MAX_TOKEN_AMOUNT: i64 = 1_000_000_000;

fn not_found(task_id: &str) -> anyhow::Error {
    BudgetError::NotFound {
        task_id: task_id.to_string(),
    }
    .into()
}

/// Token ledger over the `token_budgets` table.
///
/// Every read-check-write runs inside one `DbHandle::call` closure and one
/// SQLite transaction, so concurrent operations on a task serialize.
#[derive(Clone)]
pub struct BudgetLedger {
    db: DbHandle,
}

impl BudgetLedger {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Create the task's budget from its depth template, scaled to
    /// `custom_total` when given.
    pub async fn initialize(
        &self,
        task_id: &str,
        depth: DepthTier,
        custom_total: Option<i64>,
    ) -> Result<BudgetState, BudgetError> {
        if let Some(total) = custom_total
            && total <= 0
        {
            return Err(BudgetError::InvalidAmount {
                amount: total,
                reason: "custom budget must be positive",
            });
        }
        let (total, allocations) = template_for(depth).resolve(custom_total);
        let state = BudgetState::new(task_id, total, allocations, now_utc());

        let id = task_id.to_string();
        let row = state.clone();
        self.db
            .call(move |db| {
                db.atomically(|db| {
                    if db.get_budget(&id)?.is_some() {
                        return Err(BudgetError::AlreadyInitialized { task_id: id.clone() }.into());
                    }
                    db.insert_budget(&row)
                })
            })
            .await
            .map_err(lift)?;

        info!(
            task_id,
            depth = %depth,
            total_budget = state.total_budget,
            "Token budget initialized"
        );
        Ok(state)
    }

    pub async fn get_budget(&self, task_id: &str) -> Result<Option<BudgetState>, BudgetError> {
        let id = task_id.to_string();
        self.db
            .call(move |db| db.get_budget(&id))
            .await
            .map_err(BudgetError::Storage)
    }

    async fn require(&self, task_id: &str) -> Result<BudgetState, BudgetError> {
        self.get_budget(task_id)
            .await?
            .ok_or_else(|| BudgetError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Tokens `phase` may spend now: the lesser of its remaining allocation
    /// and the task's remaining total. May be zero or negative.
    pub async fn get_phase_allocation(&self, task_id: &str, phase: &str) -> Result<i64, BudgetError> {
        let state = self.require(task_id).await?;
        let available = state.available_for(phase);
        debug!(
            task_id,
            phase,
            allocated = state.phase_allocation(phase),
            used = state.phase_used(phase),
            remaining_total = state.remaining_tokens(),
            available,
            "Phase allocation computed"
        );
        Ok(available)
    }

    /// Record `amount` tokens against `phase`.
    ///
    /// Returns `false` (and raises `budget_exceeded` without touching the
    /// counters) when the whole-task budget would be overrun. Overrunning the
    /// phase's own allocation is recorded in `exceeded_phases` but accepted.
    pub async fn consume(&self, task_id: &str, phase: &str, amount: i64) -> Result<bool, BudgetError> {
        if amount < 0 {
            return Err(BudgetError::InvalidAmount {
                amount,
                reason: "consumption cannot be negative",
            });
        }
        if amount > MAX_TOKEN_AMOUNT {
            return Err(BudgetError::InvalidAmount {
                amount,
                reason: "consumption exceeds the per-call limit",
            });
        }
        let (id, ph) = (task_id.to_string(), phase.to_string());
        let (accepted, state) = self
            .db
            .call(move |db| {
                db.atomically(|db| {
                    let current = db.get_budget(&id)?.ok_or_else(|| not_found(&id))?;
                    let now = now_utc();
                    if current.would_exceed(amount) {
                        let flagged = current.with_exceeded(now);
                        db.save_budget(&flagged)?;
                        return Ok((false, flagged));
                    }
                    let next = current
                        .with_consumption(&ph, amount, now)
                        .ok_or_else(|| overflow(amount))?;
                    db.save_budget(&next)?;
                    Ok((true, next))
                })
            })
            .await
            .map_err(lift)?;

        if accepted {
            info!(
                task_id,
                phase,
                tokens_used = amount,
                total_consumed = state.consumed_tokens,
                remaining_tokens = state.remaining_tokens(),
                phase_exceeded = state.exceeded_phases.contains(phase),
                "Tokens consumed"
            );
        } else {
            warn!(
                task_id,
                phase,
                attempted = amount,
                current_consumed = state.consumed_tokens,
                total_budget = state.total_budget,
                "Token budget exceeded"
            );
        }
        Ok(accepted)
    }

    /// Raise the task's total by `additional` and clear the exceeded flag.
    pub async fn allocate_emergency(
        &self,
        task_id: &str,
        additional: i64,
        reason: &str,
    ) -> Result<BudgetState, BudgetError> {
        if additional < 0 {
            return Err(BudgetError::InvalidAmount {
                amount: additional,
                reason: "emergency allocation cannot be negative",
            });
        }
        if additional > MAX_TOKEN_AMOUNT {
            return Err(BudgetError::InvalidAmount {
                amount: additional,
                reason: "emergency allocation exceeds the per-call limit",
            });
        }
        let id = task_id.to_string();
        let state = self
            .db
            .call(move |db| {
                db.atomically(|db| {
                    let current = db.get_budget(&id)?.ok_or_else(|| not_found(&id))?;
                    let next = current
                        .with_additional(additional, now_utc())
                        .ok_or_else(|| overflow(additional))?;
                    db.save_budget(&next)?;
                    Ok(next)
                })
            })
            .await
            .map_err(lift)?;

        info!(
            task_id,
            additional_tokens = additional,
            new_total = state.total_budget,
            justification = reason,
            "Emergency budget allocated"
        );
        Ok(state)
    }

    /// Zero all consumption and clear both exceeded markers. Returns `false`
    /// when the task has no budget.
    pub async fn reset(&self, task_id: &str) -> Result<bool, BudgetError> {
        let id = task_id.to_string();
        let reset = self
            .db
            .call(move |db| {
                db.atomically(|db| match db.get_budget(&id)? {
                    Some(current) => {
                        db.save_budget(&current.reset(now_utc()))?;
                        Ok(true)
                    }
                    None => Ok(false),
                })
            })
            .await
            .map_err(BudgetError::Storage)?;
        if reset {
            info!(task_id, "Budget reset");
        }
        Ok(reset)
    }

    pub async fn recommendations(&self, task_id: &str) -> Result<Option<BudgetReport>, BudgetError> {
        Ok(self.get_budget(task_id).await?.as_ref().map(build_report))
    }
}
