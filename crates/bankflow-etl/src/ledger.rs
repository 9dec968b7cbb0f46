//! Ingestion ledger: the append-only record of source files already loaded
//! into staging, keyed by content fingerprint.

use crate::error::{EtlError, EtlResult};
use async_trait::async_trait;
use bankflow_common::Fingerprint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::{debug, instrument};

/// Deterministic content hash of a source file.
pub fn fingerprint_of(content: &[u8]) -> Fingerprint {
    Fingerprint::of(content)
}

/// One ledger entry. Never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFileRecord {
    pub fingerprint: Fingerprint,
    pub path: String,
    pub row_count: u64,
    pub size_bytes: u64,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total_files: u64,
    pub total_rows: u64,
    pub total_bytes: u64,
    pub last_ingested_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IngestionLedger: Send + Sync {
    async fn has_been_ingested(&self, fingerprint: &Fingerprint) -> EtlResult<bool>;

    /// Append an entry. Fails with [`EtlError::DuplicateIngestion`] when the
    /// fingerprint is already present.
    async fn record_ingested(
        &self,
        fingerprint: &Fingerprint,
        path: &str,
        row_count: u64,
        size_bytes: u64,
    ) -> EtlResult<SourceFileRecord>;

    async fn entries(&self) -> EtlResult<Vec<SourceFileRecord>>;

    async fn summary(&self) -> EtlResult<LedgerSummary>;
}

#[derive(FromRow)]
struct LedgerRow {
    fingerprint: String,
    source_path: String,
    row_count: i64,
    size_bytes: i64,
    ingested_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for SourceFileRecord {
    type Error = EtlError;

    fn try_from(row: LedgerRow) -> EtlResult<Self> {
        Ok(Self {
            fingerprint: row.fingerprint.parse()?,
            path: row.source_path,
            row_count: u64::try_from(row.row_count).unwrap_or_default(),
            size_bytes: u64::try_from(row.size_bytes).unwrap_or_default(),
            ingested_at: row.ingested_at,
        })
    }
}

/// Ledger stored in the staging database (`ingestion_ledger`).
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IngestionLedger for SqliteLedger {
    #[instrument(skip(self), fields(fingerprint = %fingerprint.short()))]
    async fn has_been_ingested(&self, fingerprint: &Fingerprint) -> EtlResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM ingestion_ledger WHERE fingerprint = ?")
                .bind(fingerprint.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    #[instrument(skip(self), fields(fingerprint = %fingerprint.short()))]
    async fn record_ingested(
        &self,
        fingerprint: &Fingerprint,
        path: &str,
        row_count: u64,
        size_bytes: u64,
    ) -> EtlResult<SourceFileRecord> {
        let record = SourceFileRecord {
            fingerprint: fingerprint.clone(),
            path: path.to_string(),
            row_count,
            size_bytes,
            ingested_at: Utc::now(),
        };

        let result = sqlx::query(
            "INSERT INTO ingestion_ledger (fingerprint, source_path, row_count, size_bytes, ingested_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.fingerprint.as_str())
        .bind(&record.path)
        .bind(i64::try_from(row_count).unwrap_or(i64::MAX))
        .bind(i64::try_from(size_bytes).unwrap_or(i64::MAX))
        .bind(record.ingested_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(path, row_count, "Recorded ledger entry");
                Ok(record)
            }
            Err(e) => match EtlError::from(e) {
                e if e.is_unique_violation() => Err(EtlError::DuplicateIngestion {
                    fingerprint: fingerprint.to_string(),
                    path: path.to_string(),
                }),
                e => Err(e),
            },
        }
    }

    async fn entries(&self) -> EtlResult<Vec<SourceFileRecord>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT fingerprint, source_path, row_count, size_bytes, ingested_at
             FROM ingestion_ledger
             ORDER BY ingested_at, source_path",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SourceFileRecord::try_from).collect()
    }

    async fn summary(&self) -> EtlResult<LedgerSummary> {
        let (total_files, total_rows, total_bytes, last): (i64, i64, i64, Option<DateTime<Utc>>) =
            sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(row_count), 0), COALESCE(SUM(size_bytes), 0),
                        MAX(ingested_at)
                 FROM ingestion_ledger",
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(LedgerSummary {
            total_files: u64::try_from(total_files).unwrap_or_default(),
            total_rows: u64::try_from(total_rows).unwrap_or_default(),
            total_bytes: u64::try_from(total_bytes).unwrap_or_default(),
            last_ingested_at: last,
        })
    }
}
