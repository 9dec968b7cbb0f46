//! Cycle orchestration: Extract, Transform, Load in strict sequence.
//!
//! At most one phase or cycle runs per orchestrator at a time; a trigger that
//! arrives while one is active is skipped, not queued. Phase failures are
//! reported in the result and never returned as errors, so a scheduler
//! survives them and simply tries again on its next tick.

use crate::config::EtlConfig;
use crate::db::TierPools;
use crate::entity::Entity;
use crate::error::{EtlError, EtlResult};
use crate::extract::{ExtractReport, Extractor};
use crate::ledger::{IngestionLedger, LedgerSummary, SqliteLedger};
use crate::load::{IncrementalLoader, LoadReport, RetryPolicy, SyncStatus};
use crate::source::FileSource;
use crate::store::{
    ProductionStore, SqliteProductionStore, SqliteStagingStore, SqliteTransformStore, StagingStore,
    TransformStore,
};
use crate::transform::{DataQuality, TransformEngine, TransformReport};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Extract,
    Transform,
    Load,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Extract, Phase::Transform, Phase::Load];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Extract => "extract",
            Phase::Transform => "transform",
            Phase::Load => "load",
        }
    }
}

impl FromStr for Phase {
    type Err = EtlError;

    fn from_str(s: &str) -> EtlResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "extract" => Ok(Phase::Extract),
            "transform" => Ok(Phase::Transform),
            "load" | "incremental" => Ok(Phase::Load),
            other => Err(EtlError::Config(format!(
                "Unknown phase '{}'. Expected extract, transform or load",
                other
            ))),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Row counts for one entity within one phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityPhaseResult {
    pub entity: Entity,
    pub rows_processed: u64,
    pub rows_failed: u64,
    pub rows_skipped: u64,
    /// Extract only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<FileCounts>,
    /// Transform only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<DataQuality>,
}

impl EntityPhaseResult {
    fn rows(entity: Entity, rows_processed: u64, rows_failed: u64, rows_skipped: u64) -> Self {
        Self {
            entity,
            rows_processed,
            rows_failed,
            rows_skipped,
            files: None,
            quality: None,
        }
    }
}

/// File counts for the extract phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileCounts {
    pub ingested: u64,
    pub skipped_duplicate: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub entities: Vec<EntityPhaseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<FileCounts>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    #[serde(flatten)]
    pub status: PhaseStatus,
}

impl PhaseResult {
    fn new(phase: Phase, duration: Duration, status: PhaseStatus) -> Self {
        Self {
            phase,
            entities: Vec::new(),
            files: None,
            duration,
            status,
        }
    }

    fn skipped(phase: Phase, reason: &str) -> Self {
        Self::new(phase, Duration::ZERO, PhaseStatus::Skipped(reason.to_string()))
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, PhaseStatus::Failed(_))
    }

    pub fn rows_processed(&self) -> u64 {
        self.entities.iter().map(|e| e.rows_processed).sum()
    }

    pub fn rows_failed(&self) -> u64 {
        self.entities.iter().map(|e| e.rows_failed).sum()
    }

    pub fn entity(&self, entity: Entity) -> Option<&EntityPhaseResult> {
        self.entities.iter().find(|e| e.entity == entity)
    }
}

impl From<&ExtractReport> for PhaseResult {
    fn from(report: &ExtractReport) -> Self {
        let mut result = PhaseResult::new(Phase::Extract, Duration::ZERO, PhaseStatus::Completed);
        result.entities = report
            .by_entity()
            .into_iter()
            .map(|(entity, counts)| EntityPhaseResult {
                files: Some(FileCounts {
                    ingested: counts.files_ingested,
                    skipped_duplicate: counts.files_skipped,
                    rejected: counts.files_rejected,
                }),
                ..EntityPhaseResult::rows(entity, counts.rows_written, counts.rows_dropped, 0)
            })
            .collect();
        result.files = Some(FileCounts {
            ingested: report.ingested() as u64,
            skipped_duplicate: report.skipped() as u64,
            rejected: report.rejected() as u64,
        });
        result
    }
}

impl From<&TransformReport> for PhaseResult {
    fn from(report: &TransformReport) -> Self {
        let mut result = PhaseResult::new(Phase::Transform, Duration::ZERO, PhaseStatus::Completed);
        result.entities = report
            .entities
            .iter()
            .map(|e| EntityPhaseResult {
                quality: Some(e.quality),
                ..EntityPhaseResult::rows(e.entity, e.transformed, e.quarantined, 0)
            })
            .collect();
        result
    }
}

impl From<&[LoadReport]> for PhaseResult {
    fn from(reports: &[LoadReport]) -> Self {
        let mut result = PhaseResult::new(Phase::Load, Duration::ZERO, PhaseStatus::Completed);
        result.entities = reports
            .iter()
            .map(|r| {
                EntityPhaseResult::rows(r.entity, r.rows_loaded, r.rows_failed, r.already_present)
            })
            .collect();
        result
    }
}

/// Structured record of one cycle, logged as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub phases: Vec<PhaseResult>,
    pub aborted_at: Option<Phase>,
    pub abort_reason: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl CycleSummary {
    pub fn succeeded(&self) -> bool {
        self.aborted_at.is_none()
            && self.phases.len() == Phase::ALL.len()
            && self.phases.iter().all(PhaseResult::is_completed)
    }

    /// True when the cycle never started because another one was running.
    pub fn was_skipped(&self) -> bool {
        self.phases.is_empty() && self.aborted_at.is_none()
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// The four stores a pipeline runs against.
#[derive(Clone)]
pub struct PipelineStores {
    pub ledger: Arc<dyn IngestionLedger>,
    pub staging: Arc<dyn StagingStore>,
    pub transform: Arc<dyn TransformStore>,
    pub production: Arc<dyn ProductionStore>,
}

impl PipelineStores {
    pub fn sqlite(pools: &TierPools) -> Self {
        Self {
            ledger: Arc::new(SqliteLedger::new(pools.staging.clone())),
            staging: Arc::new(SqliteStagingStore::new(pools.staging.clone())),
            transform: Arc::new(SqliteTransformStore::new(pools.transform.clone())),
            production: Arc::new(SqliteProductionStore::new(pools.production.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub as_of: NaiveDate,
}

impl From<&EtlConfig> for PipelineSettings {
    fn from(config: &EtlConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            retry: RetryPolicy::from(&config.load),
            as_of: config.as_of(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub ledger: LedgerSummary,
    pub sync: Vec<SyncStatus>,
    pub quarantined: BTreeMap<Entity, u64>,
}

pub struct CycleOrchestrator {
    stores: PipelineStores,
    source: Arc<dyn FileSource>,
    extractor: Extractor,
    engine: TransformEngine,
    loader: IncrementalLoader,
    running: Mutex<()>,
    cycles: AtomicU64,
    shutdown: CancellationToken,
}

impl CycleOrchestrator {
    pub fn new(
        stores: PipelineStores,
        source: Arc<dyn FileSource>,
        settings: PipelineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            extractor: Extractor::new(
                stores.ledger.clone(),
                stores.staging.clone(),
                settings.batch_size,
            ),
            engine: TransformEngine::new(
                stores.staging.clone(),
                stores.transform.clone(),
                settings.as_of,
            ),
            loader: IncrementalLoader::new(
                stores.transform.clone(),
                stores.production.clone(),
                settings.retry,
            ),
            stores,
            source,
            running: Mutex::new(()),
            cycles: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn stores(&self) -> &PipelineStores {
        &self.stores
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one phase on its own, or report it skipped if a cycle is active.
    pub async fn run_phase(&self, phase: Phase) -> PhaseResult {
        let Ok(_running) = self.running.try_lock() else {
            warn!(phase = %phase, "Pipeline busy, skipping phase trigger");
            return PhaseResult::skipped(phase, "cycle already running");
        };
        self.execute(phase, None).await
    }

    /// Load a single entity, under the same exclusion as [`Self::run_phase`].
    pub async fn run_load_for(&self, entity: Entity) -> PhaseResult {
        let Ok(_running) = self.running.try_lock() else {
            return PhaseResult::skipped(Phase::Load, "cycle already running");
        };
        self.execute(Phase::Load, Some(entity)).await
    }

    /// Extract, transform and load in order. A failed phase or a shutdown
    /// request stops the cycle before the next phase starts.
    pub async fn run_full_cycle(&self) -> CycleSummary {
        let started = Instant::now();
        let mut summary = CycleSummary {
            cycle_id: Uuid::new_v4(),
            cycle_number: 0,
            started_at: Utc::now(),
            phases: Vec::with_capacity(Phase::ALL.len()),
            aborted_at: None,
            abort_reason: None,
            duration: Duration::ZERO,
        };

        let Ok(_running) = self.running.try_lock() else {
            warn!(cycle_id = %summary.cycle_id, "Previous cycle still running, skipping this trigger");
            return summary;
        };
        summary.cycle_number = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!(cycle_id = %summary.cycle_id, cycle = summary.cycle_number, "Cycle started");

        for phase in Phase::ALL {
            if self.shutdown.is_cancelled() {
                summary.aborted_at = Some(phase);
                summary.abort_reason = Some("shutdown requested".to_string());
                warn!(phase = %phase, "Shutdown requested, stopping cycle before phase");
                break;
            }

            let result = self.execute(phase, None).await;
            let failure = match &result.status {
                PhaseStatus::Failed(reason) => Some(reason.clone()),
                _ => None,
            };
            summary.phases.push(result);

            if let Some(reason) = failure {
                error!(phase = %phase, reason = %reason, "Phase failed, aborting cycle");
                summary.aborted_at = Some(phase);
                summary.abort_reason = Some(reason);
                break;
            }
        }

        summary.duration = started.elapsed();
        match serde_json::to_string(&summary) {
            Ok(json) => info!(summary = %json, succeeded = summary.succeeded(), "Cycle finished"),
            Err(e) => warn!(error = %e, "Could not serialize cycle summary"),
        }
        summary
    }

    async fn execute(&self, phase: Phase, only: Option<Entity>) -> PhaseResult {
        let started = Instant::now();
        let outcome = match phase {
            Phase::Extract => self
                .extractor
                .extract_from(self.source.as_ref())
                .await
                .map(|report| PhaseResult::from(&report)),
            Phase::Transform => self
                .engine
                .transform_all()
                .await
                .map(|report| PhaseResult::from(&report)),
            Phase::Load => match only {
                Some(entity) => self
                    .loader
                    .load_new_rows(entity)
                    .await
                    .map(|report| PhaseResult::from(std::slice::from_ref(&report))),
                None => self
                    .loader
                    .load_all()
                    .await
                    .map(|reports| PhaseResult::from(reports.as_slice())),
            },
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let fatal = EtlError::phase_fatal(phase.as_str(), &e);
                error!(error = %fatal, "Phase failed");
                PhaseResult::new(phase, Duration::ZERO, PhaseStatus::Failed(e.to_string()))
            }
        };
        result.duration = started.elapsed();

        info!(
            phase = %phase,
            rows_processed = result.rows_processed(),
            rows_failed = result.rows_failed(),
            duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "Phase finished"
        );
        result
    }

    pub async fn status(&self) -> EtlResult<PipelineStatus> {
        let mut quarantined = BTreeMap::new();
        for entity in Entity::ALL {
            let rows = self.stores.transform.quarantined(entity).await?;
            quarantined.insert(entity, rows.len() as u64);
        }
        Ok(PipelineStatus {
            ledger: self.stores.ledger.summary().await?,
            sync: self.loader.sync_status().await?,
            quarantined,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub skipped_runs: u64,
}

impl SchedulerStats {
    fn record(&mut self, summary: &CycleSummary) {
        if summary.was_skipped() {
            self.skipped_runs += 1;
            return;
        }
        self.total_runs += 1;
        if summary.succeeded() {
            self.successful_runs += 1;
        } else {
            self.failed_runs += 1;
        }
    }
}

/// Fixed-interval driver. The first cycle starts immediately; ticks missed
/// while a cycle runs are dropped rather than replayed.
pub struct Scheduler {
    orchestrator: Arc<CycleOrchestrator>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<CycleOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run cycles until the orchestrator's shutdown token is cancelled.
    pub async fn run(&self) -> SchedulerStats {
        let shutdown = self.orchestrator.shutdown_token();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats = SchedulerStats::default();

        info!(interval_secs = self.interval.as_secs(), "Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.orchestrator.run_full_cycle().await;
                    stats.record(&summary);
                    info!(
                        total_runs = stats.total_runs,
                        successful_runs = stats.successful_runs,
                        failed_runs = stats.failed_runs,
                        "Scheduled cycle complete"
                    );
                }
            }
        }

        info!(
            total_runs = stats.total_runs,
            successful_runs = stats.successful_runs,
            "Scheduler stopped"
        );
        stats
    }
}
