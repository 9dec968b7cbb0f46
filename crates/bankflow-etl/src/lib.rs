//! Bankflow ETL Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves banking records (branches, customers, loans, transactions) through
//! three storage tiers on a schedule:
//!
//! - **Staging**: raw string copies of ingested CSV rows, keyed by natural key
//! - **Transform**: cleaned, typed and enriched rows, rebuilt from staging
//! - **Production**: append-only, query-ready rows
//!
//! # Incremental State
//!
//! Two mechanisms keep repeated cycles safe:
//!
//! - The [`ledger`] records every ingested file by content fingerprint, so a
//!   file is ingested once regardless of its name.
//! - The [`load`] reconciler copies only the natural keys that are present in
//!   the transform tier and absent from production.
//!
//! Both are backed by a uniqueness constraint in SQLite, so racing triggers
//! cannot produce duplicates.
//!
//! # Example
//!
//! ```no_run
//! use bankflow_etl::config::EtlConfig;
//! use bankflow_etl::db::TierPools;
//! use bankflow_etl::orchestrator::{CycleOrchestrator, PipelineSettings, PipelineStores};
//! use bankflow_etl::source::DirectorySource;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = EtlConfig::load()?;
//! let pools = TierPools::connect(&config.database).await?;
//!
//! let orchestrator = CycleOrchestrator::new(
//!     PipelineStores::sqlite(&pools),
//!     Arc::new(DirectorySource::new(&config.data_dir)),
//!     PipelineSettings::from(&config),
//!     CancellationToken::new(),
//! );
//! let summary = orchestrator.run_full_cycle().await;
//! println!("cycle succeeded: {}", summary.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod export;
pub mod extract;
pub mod ledger;
pub mod load;
pub mod orchestrator;
pub mod record;
pub mod source;
pub mod store;
pub mod transform;

pub use entity::Entity;
pub use error::{EtlError, EtlResult};
pub use orchestrator::{CycleOrchestrator, CycleSummary, Phase, PhaseResult, PhaseStatus};
