//! Persistent circuit breakers guarding phase executors.
//!
//! Transitions:
//! - Closed: success resets failures; a failure increments and opens the
//!   circuit at `failure_threshold`
//! - Open: calls are rejected until `recovery_timeout` has passed since the
//!   last failure, then the next call moves to HalfOpen and runs
//! - HalfOpen: `success_threshold` successes close the circuit; any failure
//!   reopens it
//!
//! Every call is bounded by `call_timeout`; a timeout counts as a failure.
//! State is upserted after every outcome so a restart resumes where the
//! process stopped.

pub mod registry;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::errors::BreakerError;
use crate::store::{BreakerRecord, DbHandle, now_utc};

pub use crate::store::CircuitState;
pub use registry::BreakerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(120),
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_secs: u64,
}

/// Circuit breaker for one named executor.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    record: Mutex<BreakerRecord>,
    db: DbHandle,
}

impl CircuitBreaker {
    /// Build a breaker from a persisted record (or a fresh closed one).
    pub fn from_record(record: BreakerRecord, config: BreakerConfig, db: DbHandle) -> Self {
        Self {
            name: record.name.clone(),
            config,
            record: Mutex::new(record),
            db,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub async fn status(&self) -> BreakerStatus {
        let rec = self.record.lock().await;
        BreakerStatus {
            name: self.name.clone(),
            state: rec.state,
            failure_count: rec.failure_count,
            success_count: rec.success_count,
            last_failure_at: rec.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.record.lock().await.state
    }

    /// Run `f` through the breaker.
    ///
    /// The breaker lock is not held while `f` runs, so concurrent calls
    /// proceed; only the bookkeeping around them is serialized.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.admit::<E>().await?;

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.on_success().await;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure(&err.to_string()).await;
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.on_failure("call timed out").await;
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.config.call_timeout,
                })
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut rec = self.record.lock().await;
        if rec.state != CircuitState::Open {
            return Ok(());
        }

        let recovered = match rec.last_failure_at {
            // Never stuck open without a timestamp to measure from.
            None => true,
            Some(at) => {
                let elapsed = (now_utc() - at).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.config.recovery_timeout
            }
        };
        if !recovered {
            debug!(breaker = %self.name, "Call rejected, circuit open");
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }

        info!(breaker = %self.name, "Circuit breaker half-open, attempting trial call");
        rec.state = CircuitState::HalfOpen;
        rec.success_count = 0;
        self.persist(&mut rec).await;
        Ok(())
    }

    async fn on_success(&self) {
        let mut rec = self.record.lock().await;
        match rec.state {
            CircuitState::Closed => {
                rec.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                rec.success_count += 1;
                if rec.success_count >= self.config.success_threshold {
                    info!(
                        breaker = %self.name,
                        successes = rec.success_count,
                        "Circuit breaker closing after successful recovery"
                    );
                    rec.state = CircuitState::Closed;
                    rec.failure_count = 0;
                    rec.success_count = 0;
                }
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Success recorded while circuit open");
                return;
            }
        }
        self.persist(&mut rec).await;
    }

    async fn on_failure(&self, reason: &str) {
        let mut rec = self.record.lock().await;
        match rec.state {
            CircuitState::Closed => {
                rec.failure_count += 1;
                rec.last_failure_at = Some(now_utc());
                if rec.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = rec.failure_count,
                        reason,
                        "Circuit breaker opening due to failures"
                    );
                    rec.state = CircuitState::Open;
                } else {
                    debug!(breaker = %self.name, failures = rec.failure_count, reason, "Call failed");
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    breaker = %self.name,
                    reason,
                    "Circuit breaker re-opening after half-open failure"
                );
                rec.failure_count += 1;
                rec.last_failure_at = Some(now_utc());
                rec.state = CircuitState::Open;
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, reason, "Failure recorded while circuit open");
                return;
            }
        }
        self.persist(&mut rec).await;
    }

    /// Open the circuit now; the recovery timer starts from this moment.
    pub async fn force_open(&self) {
        let mut rec = self.record.lock().await;
        info!(breaker = %self.name, old_state = %rec.state, "Circuit breaker forced open");
        rec.state = CircuitState::Open;
        rec.success_count = 0;
        rec.last_failure_at = Some(now_utc());
        self.persist(&mut rec).await;
    }

    pub async fn force_close(&self) {
        let mut rec = self.record.lock().await;
        info!(breaker = %self.name, old_state = %rec.state, "Circuit breaker forced closed");
        rec.state = CircuitState::Closed;
        rec.failure_count = 0;
        rec.success_count = 0;
        self.persist(&mut rec).await;
    }

    /// Upsert the record. A storage failure is logged, never surfaced, so it
    /// cannot mask the outcome of the call being recorded.
    async fn persist(&self, rec: &mut BreakerRecord) {
        rec.updated_at = now_utc();
        let snapshot = rec.clone();
        if let Err(e) = self.db.call(move |db| db.upsert_breaker(&snapshot)).await {
            error!(breaker = %self.name, error = %e, "Failed to persist breaker state");
        }
    }
}
