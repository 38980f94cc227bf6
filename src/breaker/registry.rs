use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;

use super::{BreakerConfig, BreakerStatus, CircuitBreaker};
use crate::store::{BreakerRecord, DbHandle, now_utc};

/// One breaker per executor name, built lazily from persisted state and
/// cached for the life of the process.
pub struct BreakerRegistry {
    db: DbHandle,
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(db: DbHandle, defaults: BreakerConfig) -> Self {
        Self {
            db,
            defaults,
            overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Use `config` instead of the defaults for breakers named `name`.
    pub fn with_override(mut self, name: &str, config: BreakerConfig) -> Self {
        self.overrides.insert(name.to_string(), config);
        self
    }

    fn config_for(&self, name: &str) -> BreakerConfig {
        self.overrides.get(name).copied().unwrap_or(self.defaults)
    }

    /// The breaker for `name`, loading its persisted state on first use.
    pub async fn get(&self, name: &str) -> Result<Arc<CircuitBreaker>> {
        let mut breakers = self.breakers.lock().await;
        if let Some(existing) = breakers.get(name) {
            return Ok(existing.clone());
        }

        let key = name.to_string();
        let record = self
            .db
            .call(move |db| match db.load_breaker(&key)? {
                Some(rec) => Ok(rec),
                None => {
                    let fresh = BreakerRecord::closed(&key, now_utc());
                    db.upsert_breaker(&fresh)?;
                    Ok(fresh)
                }
            })
            .await?;
        debug!(breaker = name, state = %record.state, "Circuit breaker loaded");

        let breaker = Arc::new(CircuitBreaker::from_record(
            record,
            self.config_for(name),
            self.db.clone(),
        ));
        breakers.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Status of every known breaker, cached or only persisted.
    pub async fn all_status(&self) -> Result<BTreeMap<String, BreakerStatus>> {
        let persisted = self.db.call(|db| db.list_breakers()).await?;
        let mut names: BTreeSet<String> = persisted.into_iter().map(|r| r.name).collect();
        names.extend(self.breakers.lock().await.keys().cloned());

        let mut out = BTreeMap::new();
        for name in names {
            let breaker = self.get(&name).await?;
            out.insert(name, breaker.status().await);
        }
        Ok(out)
    }
}
