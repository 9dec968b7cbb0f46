//! Extract phase: source files into the staging tier, gated by the ledger.
//!
//! Per file the order is fingerprint, ledger check, parse, staging upsert,
//! ledger entry. A crash between the upsert and the ledger entry leaves the
//! file unrecorded, so the next run ingests it again; the upsert by natural
//! key makes that second pass harmless.

use crate::entity::{natural_key_cmp, same_column_set, Entity};
use crate::error::{EtlError, EtlResult};
use crate::ledger::{fingerprint_of, IngestionLedger};
use crate::record::StagingRow;
use crate::source::{FileSource, SourceFile};
use crate::store::{StagingStore, UpsertCounts};
use bankflow_common::Fingerprint;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Cell values treated as missing.
const NULL_TOKENS: &[&str] = &["", "nan", "none", "nat", "<na>", "null"];

fn normalize_cell(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if NULL_TOKENS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A source file parsed into staging rows.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub entity: Entity,
    /// Unique by natural key, in natural-key order.
    pub rows: Vec<StagingRow>,
    /// Rows without a natural key.
    pub dropped: u64,
    /// Rows superseded by a later row with the same key in the same file.
    pub superseded: u64,
}

fn csv_reader(file: &SourceFile) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file.content.as_slice())
}

fn read_header(reader: &mut csv::Reader<&[u8]>) -> EtlResult<Vec<String>> {
    Ok(reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect())
}

/// Entity of a source file from its name, else from its header. Rows are
/// not read.
pub fn detect_entity(file: &SourceFile) -> Option<Entity> {
    Entity::from_file_name(file.file_name()).or_else(|| {
        let header = read_header(&mut csv_reader(file)).ok()?;
        Entity::from_header(&header)
    })
}

/// Parse a source file. The entity comes from the file name when it starts
/// with a table name, otherwise from the header's column set.
///
/// Any malformed record, such as a row with the wrong number of fields,
/// fails the whole file.
pub fn parse_csv(file: &SourceFile) -> EtlResult<ParsedFile> {
    let mismatch = |reason: String| EtlError::SchemaMismatch {
        path: file.path.clone(),
        reason,
    };

    let mut reader = csv_reader(file);
    let header = read_header(&mut reader)?;

    let entity = Entity::from_file_name(file.file_name())
        .or_else(|| Entity::from_header(&header))
        .ok_or_else(|| mismatch(format!("header {:?} matches no known entity", header)))?;

    if !same_column_set(entity.raw_columns(), &header) {
        let missing: Vec<&str> = entity
            .raw_columns()
            .iter()
            .copied()
            .filter(|c| !header.iter().any(|h| h == c))
            .collect();
        let unexpected: Vec<&str> = header
            .iter()
            .map(String::as_str)
            .filter(|h| !entity.raw_columns().contains(h))
            .collect();
        return Err(mismatch(format!(
            "{} columns differ (missing {:?}, unexpected {:?})",
            entity, missing, unexpected
        )));
    }

    let positions: Vec<usize> = entity
        .raw_columns()
        .iter()
        .filter_map(|column| header.iter().position(|h| h == column))
        .collect();

    let mut by_key: HashMap<String, StagingRow> = HashMap::new();
    let mut dropped = 0;
    let mut superseded = 0;

    for record in reader.records() {
        let record = record?;
        let values: Vec<Option<String>> = positions
            .iter()
            .map(|&idx| record.get(idx).and_then(normalize_cell))
            .collect();

        let Some(natural_key) = values.first().cloned().flatten() else {
            dropped += 1;
            continue;
        };

        let row = StagingRow {
            entity,
            natural_key: natural_key.clone(),
            values,
        };
        if by_key.insert(natural_key, row).is_some() {
            superseded += 1;
        }
    }

    let mut rows: Vec<StagingRow> = by_key.into_values().collect();
    rows.sort_by(|a, b| natural_key_cmp(&a.natural_key, &b.natural_key));

    Ok(ParsedFile {
        entity,
        rows,
        dropped,
        superseded,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Ingested {
        entity: Entity,
        rows: u64,
        inserted: u64,
        updated: u64,
        dropped: u64,
    },
    /// Content already in the ledger, possibly under another name.
    SkippedDuplicate { entity: Option<Entity> },
    /// Parse or layout problem. Not recorded, so it is offered again next run.
    Rejected {
        entity: Option<Entity>,
        reason: String,
    },
}

impl FileOutcome {
    pub fn entity(&self) -> Option<Entity> {
        match self {
            FileOutcome::Ingested { entity, .. } => Some(*entity),
            FileOutcome::SkippedDuplicate { entity } | FileOutcome::Rejected { entity, .. } => *entity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    pub fingerprint: Fingerprint,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityExtractCounts {
    pub files_ingested: u64,
    pub files_skipped: u64,
    pub files_rejected: u64,
    pub rows_written: u64,
    pub rows_dropped: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractReport {
    pub files: Vec<FileReport>,
}

impl ExtractReport {
    pub fn ingested(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Ingested { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::SkippedDuplicate { .. }))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Rejected { .. }))
    }

    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| pred(&f.outcome)).count()
    }

    /// Counts per entity. Files whose entity could not be told apart are
    /// left out.
    pub fn by_entity(&self) -> BTreeMap<Entity, EntityExtractCounts> {
        let mut counts = BTreeMap::new();
        for file in &self.files {
            let Some(entity) = file.outcome.entity() else {
                continue;
            };
            let entry: &mut EntityExtractCounts = counts.entry(entity).or_default();
            match file.outcome {
                FileOutcome::Ingested { rows, dropped, .. } => {
                    entry.files_ingested += 1;
                    entry.rows_written += rows;
                    entry.rows_dropped += dropped;
                }
                FileOutcome::SkippedDuplicate { .. } => entry.files_skipped += 1,
                FileOutcome::Rejected { .. } => entry.files_rejected += 1,
            }
        }
        counts
    }
}

pub struct Extractor {
    ledger: Arc<dyn IngestionLedger>,
    staging: Arc<dyn StagingStore>,
    batch_size: usize,
}

impl Extractor {
    pub fn new(
        ledger: Arc<dyn IngestionLedger>,
        staging: Arc<dyn StagingStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            ledger,
            staging,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn extract_from(&self, source: &dyn FileSource) -> EtlResult<ExtractReport> {
        let files = source.list().await?;
        self.extract_files(&files).await
    }

    /// Process files in order. Only store failures abort the run; a bad file
    /// is reported and the rest continue.
    pub async fn extract_files(&self, files: &[SourceFile]) -> EtlResult<ExtractReport> {
        let mut report = ExtractReport::default();
        for file in files {
            let fingerprint = fingerprint_of(&file.content);
            let outcome = self.extract_file(file, &fingerprint).await?;
            report.files.push(FileReport {
                path: file.path.clone(),
                fingerprint,
                outcome,
            });
        }

        info!(
            files = files.len(),
            ingested = report.ingested(),
            skipped = report.skipped(),
            rejected = report.rejected(),
            "Extract finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, file, fingerprint), fields(path = %file.path, fingerprint = %fingerprint.short()))]
    async fn extract_file(&self, file: &SourceFile, fingerprint: &Fingerprint) -> EtlResult<FileOutcome> {
        if self.ledger.has_been_ingested(fingerprint).await? {
            info!("File content already ingested, skipping");
            return Ok(FileOutcome::SkippedDuplicate {
                entity: detect_entity(file),
            });
        }

        let parsed = match parse_csv(file) {
            Ok(parsed) => parsed,
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "Rejected source file");
                return Ok(FileOutcome::Rejected {
                    entity: detect_entity(file),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let mut counts = UpsertCounts::default();
        for batch in parsed.rows.chunks(self.batch_size) {
            counts += self.staging.upsert_rows(parsed.entity, batch).await?;
        }
        let rows = counts.total();

        match self
            .ledger
            .record_ingested(fingerprint, &file.path, rows, file.content.len() as u64)
            .await
        {
            Ok(_) => {}
            Err(e @ EtlError::DuplicateIngestion { .. }) => {
                // Another run recorded the same content between our check and now.
                info!(error = %e, "Ledger entry written concurrently, treating as duplicate");
                return Ok(FileOutcome::SkippedDuplicate {
                    entity: Some(parsed.entity),
                });
            }
            Err(e) => return Err(e),
        }

        if parsed.superseded > 0 {
            info!(superseded = parsed.superseded, "Duplicate keys in file, kept last occurrence");
        }
        info!(
            entity = %parsed.entity,
            rows,
            inserted = counts.inserted,
            updated = counts.updated,
            dropped = parsed.dropped,
            "Ingested source file"
        );

        Ok(FileOutcome::Ingested {
            entity: parsed.entity,
            rows,
            inserted: counts.inserted,
            updated: counts.updated,
            dropped: parsed.dropped,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_null_tokens() {
        assert_eq!(normalize_cell("  NaN "), None);
        assert_eq!(normalize_cell("<NA>"), None);
        assert_eq!(normalize_cell(""), None);
        assert_eq!(normalize_cell(" Pune "), Some("Pune".to_string()));
        assert_eq!(normalize_cell("N/A"), Some("N/A".to_string()));
    }

    #[test]
    fn test_parse_reorders_columns_and_keeps_last_duplicate() {
        let csv = "\u{feff}state,branch_id,branch_name,city,manager_name\n\
                   Goa,B10,Panaji Main,Panaji,\n\
                   Kerala,B2,Kochi,Kochi,Anil\n\
                   ,,Orphan,,\n\
                   Goa,B10,Panaji Central,Panaji,Rita\n";
        let parsed = parse_csv(&SourceFile::new("data/branches_q1.csv", csv)).unwrap();

        assert_eq!(parsed.entity, Entity::Branch);
        assert_eq!(parsed.dropped, 1);
        assert_eq!(parsed.superseded, 1);
        let keys: Vec<&str> = parsed.rows.iter().map(|r| r.natural_key.as_str()).collect();
        assert_eq!(keys, vec!["B2", "B10"]);
        assert_eq!(parsed.rows[1].get("branch_name"), Some("Panaji Central"));
        assert_eq!(parsed.rows[1].get("state"), Some("Goa"));
    }

    #[test]
    fn test_entity_from_header_when_name_is_generic() {
        let csv = "customer_id,branch_id,first_name,last_name,dob,gender,email,phone,address,account_open_date\n\
                   C1,B1,asha,rao,1990-01-01,F,A@X.COM,999,pune,2020-01-01\n";
        let parsed = parse_csv(&SourceFile::new("incoming/jan.csv", csv)).unwrap();
        assert_eq!(parsed.entity, Entity::Customer);
        assert_eq!(parsed.rows.len(), 1);
    }

    #[test]
    fn test_column_mismatch_is_rejected() {
        let csv = "loan_id,customer_id,loan_amount\nL1,C1,100\n";
        let err = parse_csv(&SourceFile::new("loans.csv", csv)).unwrap_err();
        assert!(matches!(err, EtlError::SchemaMismatch { .. }));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("missing"));

        let err = parse_csv(&SourceFile::new("mystery.csv", "a,b\n1,2\n")).unwrap_err();
        assert!(err.to_string().contains("matches no known entity"));
    }

    #[test]
    fn test_one_ragged_row_fails_the_file() {
        let csv = "branch_id,branch_name,city,state,manager_name\n\
                   B1,MG Road,Bengaluru,Karnataka,Asha\n\
                   B2,Kochi,Kochi\n\
                   B3,Panaji,Panaji,Goa,Rita\n";
        let err = parse_csv(&SourceFile::new("branches.csv", csv)).unwrap_err();
        assert!(matches!(err, EtlError::Csv(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_detect_entity_reads_name_then_header() {
        let branch_header = "branch_id,branch_name,city,state,manager_name\n";
        assert_eq!(
            detect_entity(&SourceFile::new("loans_2024.csv", "anything\n")),
            Some(Entity::Loan)
        );
        assert_eq!(
            detect_entity(&SourceFile::new("upload.csv", branch_header)),
            Some(Entity::Branch)
        );
        assert_eq!(detect_entity(&SourceFile::new("upload.csv", "a,b\n")), None);
    }
}
