//! Transform engine: rebuilds the transform tier from staging.
//!
//! The output for a run is a pure function of the staging content and the
//! engine's reference date. Rows that fail a rule are quarantined with the
//! reason instead of aborting the entity.

mod enrich;
pub mod rules;

pub use enrich::{flag_outliers, Enricher};

use crate::entity::Entity;
use crate::error::{EtlError, EtlResult};
use crate::record::{QuarantinedRow, TypedRecord};
use crate::store::{StagingStore, TransformStore};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Data-quality percentages for one entity, rounded to two decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DataQuality {
    /// Source cells that held a value rather than a null.
    pub completeness: f64,
    /// Staging rows that made it into the transform tier.
    pub accuracy: f64,
    /// Staging rows sharing a natural key with an earlier row.
    pub duplicate_rate: f64,
    /// Transformed rows flagged as outliers.
    pub outlier_rate: f64,
}

impl DataQuality {
    pub fn measure(counts: &EntityTransformReport, null_cells: u64, duplicates: u64) -> Self {
        let percent = |part: u64, whole: u64| {
            if whole == 0 {
                0.0
            } else {
                (part as f64 / whole as f64 * 10_000.0).round() / 100.0
            }
        };
        let cells = counts.processed * counts.entity.raw_columns().len() as u64;
        Self {
            completeness: percent(cells.saturating_sub(null_cells), cells),
            accuracy: percent(counts.transformed, counts.processed),
            duplicate_rate: percent(duplicates, counts.processed),
            outlier_rate: percent(counts.outliers, counts.transformed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityTransformReport {
    pub entity: Entity,
    pub processed: u64,
    pub transformed: u64,
    pub quarantined: u64,
    pub nulls_replaced: u64,
    pub outliers: u64,
    pub quality: DataQuality,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformReport {
    pub as_of: Option<NaiveDate>,
    pub entities: Vec<EntityTransformReport>,
}

impl TransformReport {
    pub fn total_transformed(&self) -> u64 {
        self.entities.iter().map(|e| e.transformed).sum()
    }

    pub fn total_quarantined(&self) -> u64 {
        self.entities.iter().map(|e| e.quarantined).sum()
    }
}

pub struct TransformEngine {
    staging: Arc<dyn StagingStore>,
    transform: Arc<dyn TransformStore>,
    as_of: NaiveDate,
}

impl TransformEngine {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        transform: Arc<dyn TransformStore>,
        as_of: NaiveDate,
    ) -> Self {
        Self {
            staging,
            transform,
            as_of,
        }
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    /// Rebuild every entity in referential order. Loans and transactions are
    /// checked against the customers produced by this same run.
    pub async fn transform_all(&self) -> EtlResult<TransformReport> {
        let mut report = TransformReport {
            as_of: Some(self.as_of),
            entities: Vec::with_capacity(Entity::ALL.len()),
        };
        let mut known_customers = HashSet::new();

        for entity in Entity::ALL {
            let (entity_report, records) = self.transform_entity(entity, &known_customers).await?;
            if entity == Entity::Customer {
                known_customers = records.into_iter().map(|r| r.natural_key).collect();
            }
            report.entities.push(entity_report);
        }

        info!(
            as_of = %self.as_of,
            transformed = report.total_transformed(),
            quarantined = report.total_quarantined(),
            "Transform finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, known_customers), fields(entity = %entity))]
    async fn transform_entity(
        &self,
        entity: Entity,
        known_customers: &HashSet<String>,
    ) -> EtlResult<(EntityTransformReport, Vec<TypedRecord>)> {
        let rows = self.staging.fetch_all(entity).await?;
        let mut enricher = Enricher::new(self.as_of, known_customers);
        let mut records = Vec::with_capacity(rows.len());
        let mut quarantined = Vec::new();

        let mut seen_keys = HashSet::with_capacity(rows.len());
        let mut duplicates = 0;
        let mut null_cells = 0;
        for row in &rows {
            if !seen_keys.insert(row.natural_key.as_str()) {
                duplicates += 1;
            }
            null_cells += row.values.iter().filter(|v| v.is_none()).count() as u64;
            match enricher.enrich(row) {
                Ok(record) => records.push(record),
                Err(EtlError::RowTransform { reason, .. }) => {
                    warn!(key = %row.natural_key, reason = %reason, "Quarantined row");
                    quarantined.push(QuarantinedRow {
                        entity,
                        natural_key: row.natural_key.clone(),
                        reason,
                        raw: row.to_json(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let outliers = flag_outliers(&mut records);
        self.transform
            .replace_entity(entity, &records, &quarantined)
            .await?;

        let mut report = EntityTransformReport {
            entity,
            processed: rows.len() as u64,
            transformed: records.len() as u64,
            quarantined: quarantined.len() as u64,
            nulls_replaced: enricher.nulls_replaced(),
            outliers,
            quality: DataQuality::default(),
        };
        report.quality = DataQuality::measure(&report, null_cells, duplicates);
        info!(
            processed = report.processed,
            transformed = report.transformed,
            quarantined = report.quarantined,
            nulls_replaced = report.nulls_replaced,
            outliers = report.outliers,
            completeness = report.quality.completeness,
            accuracy = report.quality.accuracy,
            duplicate_rate = report.quality.duplicate_rate,
            outlier_rate = report.quality.outlier_rate,
            "Entity transformed"
        );
        Ok((report, records))
    }
}
