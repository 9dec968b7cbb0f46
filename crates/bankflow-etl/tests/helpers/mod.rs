//! Test helpers for Bankflow ETL integration tests
//!
//! This module provides utilities for:
//! - In-memory tier databases with migrations applied
//! - CSV fixture builders for each entity
//! - Store doubles that fail on demand or race with another run
//! - An orchestrator wired to a gated file source

#![allow(dead_code)]

use async_trait::async_trait;
use bankflow_common::Fingerprint;
use bankflow_etl::db::TierPools;
use bankflow_etl::entity::Entity;
use bankflow_etl::error::{EtlError, EtlResult};
use bankflow_etl::ledger::{IngestionLedger, LedgerSummary, SourceFileRecord};
use bankflow_etl::load::RetryPolicy;
use bankflow_etl::orchestrator::{CycleOrchestrator, PipelineSettings, PipelineStores};
use bankflow_etl::record::{QuarantinedRow, TypedRecord};
use bankflow_etl::source::{FileSource, SourceFile};
use bankflow_etl::store::{InsertOutcome, ProductionStore, TransformStore};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Fixed reference date so derived ages and tenures are stable.
pub fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bankflow_etl=debug")
        .with_test_writer()
        .try_init();
}

/// Fresh in-memory tiers and the SQLite stores over them.
pub struct TestPipeline {
    pub pools: TierPools,
    pub stores: PipelineStores,
}

impl TestPipeline {
    pub async fn new() -> Self {
        init_tracing();
        let pools = TierPools::in_memory()
            .await
            .expect("Failed to create in-memory tiers");
        let stores = PipelineStores::sqlite(&pools);
        Self { pools, stores }
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            batch_size: 2,
            retry: fast_retry(3),
            as_of: as_of(),
        }
    }

    pub fn orchestrator(&self, source: Arc<dyn FileSource>) -> CycleOrchestrator {
        CycleOrchestrator::new(
            self.stores.clone(),
            source,
            self.settings(),
            CancellationToken::new(),
        )
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1))
}

pub fn branches_csv(rows: &[(&str, &str, &str, &str)]) -> String {
    let mut csv = String::from("branch_id,branch_name,city,state,manager_name\n");
    for (id, name, city, state) in rows {
        csv.push_str(&format!("{},{},{},{},Asha Rao\n", id, name, city, state));
    }
    csv
}

/// Customer rows as `(customer_id, first_name, email)`.
pub fn customers_csv(rows: &[(&str, &str, &str)]) -> String {
    let mut csv = String::from(
        "customer_id,branch_id,first_name,last_name,dob,gender,email,phone,address,account_open_date\n",
    );
    for (id, first, email) in rows {
        csv.push_str(&format!(
            "{},B1,{},sharma,1990-05-14,F,{},9876543210,12 mg road,2020-01-15\n",
            id, first, email
        ));
    }
    csv
}

/// Loan rows as `(loan_id, customer_id, loan_amount)`.
pub fn loans_csv(rows: &[(&str, &str, &str)]) -> String {
    let mut csv = String::from(
        "loan_id,customer_id,loan_type,loan_amount,interest_rate,start_date,end_date,loan_status\n",
    );
    for (id, customer, amount) in rows {
        csv.push_str(&format!(
            "{},{},home,{},8.5,2022-01-01,2032-01-01,active\n",
            id, customer, amount
        ));
    }
    csv
}

/// Transaction rows as `(transaction_id, customer_id, amount)`.
pub fn transactions_csv(rows: &[(&str, &str, &str)]) -> String {
    let mut csv = String::from(
        "transaction_id,customer_id,transaction_date,transaction_type,amount,balance_after,fraud_flag\n",
    );
    for (id, customer, amount) in rows {
        csv.push_str(&format!(
            "{},{},2024-03-05,credit,{},50000,0\n",
            id, customer, amount
        ));
    }
    csv
}

pub fn file(path: &str, content: &str) -> SourceFile {
    SourceFile::new(path, content.as_bytes().to_vec())
}

/// One small, consistent data set covering every entity.
pub fn sample_files() -> Vec<SourceFile> {
    vec![
        file(
            "branches.csv",
            &branches_csv(&[("B1", "mg road", "bengaluru", "karnataka"), ("B2", "fort", "mumbai", "maharashtra")]),
        ),
        file(
            "customers.csv",
            &customers_csv(&[("C1", "priya", "PRIYA@EXAMPLE.COM"), ("C2", "rahul", "rahul@example.com")]),
        ),
        file("loans.csv", &loans_csv(&[("L1", "C1", "250000"), ("L2", "C2", "75000")])),
        file(
            "transactions.csv",
            &transactions_csv(&[("T1", "C1", "1200"), ("T2", "C2", "80"), ("T3", "C1", "45000")]),
        ),
    ]
}

/// A fixed list of files.
pub struct StaticSource {
    files: Mutex<Vec<SourceFile>>,
}

impl StaticSource {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            files: Mutex::new(files),
        }
    }

    pub fn replace(&self, files: Vec<SourceFile>) {
        *self.files.lock().unwrap() = files;
    }
}

#[async_trait]
impl FileSource for StaticSource {
    async fn list(&self) -> EtlResult<Vec<SourceFile>> {
        Ok(self.files.lock().unwrap().clone())
    }
}

/// A source that signals `entered` when listing starts and then waits for
/// `release`, holding the extract phase open.
pub struct GatedSource {
    files: Vec<SourceFile>,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GatedSource {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            files,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl FileSource for GatedSource {
    async fn list(&self) -> EtlResult<Vec<SourceFile>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(self.files.clone())
    }
}

/// Production store that fails the first `n` inserts of chosen keys, then
/// delegates to the real store.
pub struct FlakyProduction {
    inner: Arc<dyn ProductionStore>,
    remaining: Mutex<HashMap<String, u32>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FlakyProduction {
    pub fn new(inner: Arc<dyn ProductionStore>, failures: &[(&str, u32)]) -> Self {
        Self {
            inner,
            remaining: Mutex::new(
                failures
                    .iter()
                    .map(|(key, n)| (key.to_string(), *n))
                    .collect(),
            ),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ProductionStore for FlakyProduction {
    async fn natural_keys(&self, entity: Entity) -> EtlResult<HashSet<String>> {
        self.inner.natural_keys(entity).await
    }

    async fn insert(&self, record: &TypedRecord) -> EtlResult<InsertOutcome> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(record.natural_key.clone())
            .or_default() += 1;

        let fail = {
            let mut remaining = self.remaining.lock().unwrap();
            match remaining.get_mut(&record.natural_key) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                },
                _ => false,
            }
        };
        if fail {
            return Err(EtlError::Config(format!(
                "simulated insert failure for {}",
                record.natural_key
            )));
        }
        self.inner.insert(record).await
    }

    async fn fetch(&self, entity: Entity, natural_key: &str) -> EtlResult<Option<TypedRecord>> {
        self.inner.fetch(entity, natural_key).await
    }

    async fn count(&self, entity: Entity) -> EtlResult<u64> {
        self.inner.count(entity).await
    }
}

/// Ledger whose lookup always misses, as if another run recorded the same
/// content between our check and our write. Writes go to the real ledger.
pub struct RacingLedger {
    pub inner: Arc<dyn IngestionLedger>,
}

#[async_trait]
impl IngestionLedger for RacingLedger {
    async fn has_been_ingested(&self, _fingerprint: &Fingerprint) -> EtlResult<bool> {
        Ok(false)
    }

    async fn record_ingested(
        &self,
        fingerprint: &Fingerprint,
        path: &str,
        row_count: u64,
        size_bytes: u64,
    ) -> EtlResult<SourceFileRecord> {
        self.inner
            .record_ingested(fingerprint, path, row_count, size_bytes)
            .await
    }

    async fn entries(&self) -> EtlResult<Vec<SourceFileRecord>> {
        self.inner.entries().await
    }

    async fn summary(&self) -> EtlResult<LedgerSummary> {
        self.inner.summary().await
    }
}

/// Transform store that lists extra keys whose rows are gone by the time
/// they are fetched.
pub struct VanishingTransform {
    inner: Arc<dyn TransformStore>,
    vanished: Vec<String>,
}

impl VanishingTransform {
    pub fn new(inner: Arc<dyn TransformStore>, vanished: &[&str]) -> Self {
        Self {
            inner,
            vanished: vanished.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[async_trait]
impl TransformStore for VanishingTransform {
    async fn replace_entity(
        &self,
        entity: Entity,
        records: &[TypedRecord],
        quarantined: &[QuarantinedRow],
    ) -> EtlResult<()> {
        self.inner.replace_entity(entity, records, quarantined).await
    }

    async fn natural_keys(&self, entity: Entity) -> EtlResult<HashSet<String>> {
        let mut keys = self.inner.natural_keys(entity).await?;
        keys.extend(self.vanished.iter().cloned());
        Ok(keys)
    }

    async fn fetch(&self, entity: Entity, natural_key: &str) -> EtlResult<Option<TypedRecord>> {
        if self.vanished.iter().any(|k| k == natural_key) {
            return Ok(None);
        }
        self.inner.fetch(entity, natural_key).await
    }

    async fn fetch_all(&self, entity: Entity) -> EtlResult<Vec<TypedRecord>> {
        self.inner.fetch_all(entity).await
    }

    async fn quarantined(&self, entity: Entity) -> EtlResult<Vec<QuarantinedRow>> {
        self.inner.quarantined(entity).await
    }

    async fn count(&self, entity: Entity) -> EtlResult<u64> {
        self.inner.count(entity).await
    }
}

pub fn sorted(keys: HashSet<String>) -> Vec<String> {
    let mut keys: Vec<String> = keys.into_iter().collect();
    keys.sort();
    keys
}
