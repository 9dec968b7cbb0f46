//! Incremental load: copy rows whose natural key is in the transform tier but
//! not yet in production.
//!
//! The candidate set is recomputed from both tiers on every call, so there is
//! no watermark to persist. A partially completed load is finished by the
//! next call, and keys already in production are never inserted again.
//! Production rows are never updated or deleted here.

use crate::config::LoadConfig;
use crate::entity::{natural_key_cmp, Entity};
use crate::error::{EtlError, EtlResult};
use crate::record::TypedRecord;
use crate::store::{InsertOutcome, ProductionStore, TransformStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Bounded per-row retry within a single load call. Attempt `n` is followed
/// by a pause of `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_LOAD_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(crate::config::DEFAULT_LOAD_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl From<&LoadConfig> for RetryPolicy {
    fn from(config: &LoadConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.retry_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub natural_key: String,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub entity: Entity,
    pub candidates_found: u64,
    pub rows_loaded: u64,
    pub rows_failed: u64,
    /// Candidates another loader inserted first.
    pub already_present: u64,
    pub failures: Vec<RowFailure>,
}

impl LoadReport {
    fn new(entity: Entity) -> Self {
        Self {
            entity,
            candidates_found: 0,
            rows_loaded: 0,
            rows_failed: 0,
            already_present: 0,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub entity: Entity,
    pub transform_rows: u64,
    pub production_rows: u64,
    /// Transform keys not yet in production.
    pub pending: u64,
    pub in_sync: bool,
}

pub struct IncrementalLoader {
    transform: Arc<dyn TransformStore>,
    production: Arc<dyn ProductionStore>,
    retry: RetryPolicy,
}

impl IncrementalLoader {
    pub fn new(
        transform: Arc<dyn TransformStore>,
        production: Arc<dyn ProductionStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transform,
            production,
            retry,
        }
    }

    async fn candidates(&self, entity: Entity) -> EtlResult<Vec<String>> {
        let production_keys = self.production.natural_keys(entity).await?;
        let transform_keys = self.transform.natural_keys(entity).await?;
        let mut candidates: Vec<String> = transform_keys
            .difference(&production_keys)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| natural_key_cmp(a, b));
        Ok(candidates)
    }

    /// Insert every candidate row for `entity`. Store failures while computing
    /// the candidate set are fatal for the call; failures inserting a single
    /// row are retried, then reported in the result and left for the next
    /// call.
    #[instrument(skip(self), fields(entity = %entity))]
    pub async fn load_new_rows(&self, entity: Entity) -> EtlResult<LoadReport> {
        let candidates = self.candidates(entity).await?;
        let mut report = LoadReport::new(entity);
        report.candidates_found = candidates.len() as u64;
        debug!(candidates = candidates.len(), "Computed candidate set");

        for key in &candidates {
            let Some(record) = self.transform.fetch(entity, key).await? else {
                warn!(key = %key, "Candidate disappeared from transform tier before load");
                report.rows_failed += 1;
                report.failures.push(RowFailure {
                    natural_key: key.clone(),
                    attempts: 0,
                    message: "row no longer present in transform tier".to_string(),
                });
                continue;
            };

            match self.insert_with_retry(&record).await {
                Ok(InsertOutcome::Inserted) => report.rows_loaded += 1,
                Ok(InsertOutcome::AlreadyPresent) => report.already_present += 1,
                Err(EtlError::RowLoad {
                    natural_key,
                    attempts,
                    message,
                    ..
                }) => {
                    report.rows_failed += 1;
                    report.failures.push(RowFailure {
                        natural_key,
                        attempts,
                        message,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            candidates_found = report.candidates_found,
            rows_loaded = report.rows_loaded,
            rows_failed = report.rows_failed,
            already_present = report.already_present,
            "Load finished"
        );
        Ok(report)
    }

    async fn insert_with_retry(&self, record: &TypedRecord) -> EtlResult<InsertOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.production.insert(record).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        key = %record.natural_key,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "Insert failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let err = EtlError::RowLoad {
                        entity: record.entity,
                        natural_key: record.natural_key.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    };
                    warn!(error = %err, "Giving up on row until next cycle");
                    return Err(err);
                }
            }
        }
    }

    /// Load every entity in referential order.
    pub async fn load_all(&self) -> EtlResult<Vec<LoadReport>> {
        let mut reports = Vec::with_capacity(Entity::ALL.len());
        for entity in Entity::ALL {
            reports.push(self.load_new_rows(entity).await?);
        }
        Ok(reports)
    }

    /// Compare the transform and production tiers per entity.
    pub async fn sync_status(&self) -> EtlResult<Vec<SyncStatus>> {
        let mut statuses = Vec::with_capacity(Entity::ALL.len());
        for entity in Entity::ALL {
            let pending = self.candidates(entity).await?.len() as u64;
            let status = SyncStatus {
                entity,
                transform_rows: self.transform.count(entity).await?,
                production_rows: self.production.count(entity).await?,
                pending,
                in_sync: pending == 0,
            };
            statuses.push(status);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));

        let from_config = RetryPolicy::from(&LoadConfig {
            max_attempts: 5,
            retry_delay_ms: 10,
        });
        assert_eq!(from_config, RetryPolicy::new(5, Duration::from_millis(10)));
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }
}
