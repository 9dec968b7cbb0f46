//! Bankflow - banking records ETL pipeline

use anyhow::{bail, Context, Result};
use bankflow_common::logging::{init_logging, LogConfig, LogLevel};
use bankflow_etl::config::EtlConfig;
use bankflow_etl::db::TierPools;
use bankflow_etl::entity::Entity;
use bankflow_etl::export::export_transformed;
use bankflow_etl::orchestrator::{
    CycleOrchestrator, Phase, PhaseResult, PipelineSettings, PipelineStores, Scheduler,
};
use bankflow_etl::source::DirectorySource;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bankflow")]
#[command(author, version, about = "Banking records ETL pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest new CSV files from the data directory into staging
    Extract {
        /// Directory to read CSV files from
        #[arg(short, long, env = "BANKFLOW_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Rebuild the transform tier from staging
    Transform,

    /// Copy new transform rows into production
    Load {
        /// Only load this entity (branch, customer, loan, transaction)
        #[arg(short, long)]
        entity: Option<Entity>,
    },

    /// Run one full extract, transform and load cycle
    Run,

    /// Run cycles on a fixed interval until interrupted
    Schedule {
        /// Seconds between cycle starts
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Write the transform tier to CSV files
    Export {
        /// Output directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show ledger, sync and quarantine status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("bankflow")
        .build();

    // Environment variables take precedence
    let log_config = log_config.with_env_overrides()?;

    // Keep the guard alive so file logs are flushed on exit
    let _log_guard = init_logging(&log_config)?;

    let mut config = EtlConfig::from_env().context("Failed to load configuration")?;
    if let Command::Extract {
        data_dir: Some(dir),
    } = &cli.command
    {
        config.data_dir = dir.clone();
    }

    let pools = TierPools::connect(&config.database)
        .await
        .context("Failed to open tier databases")?;

    let shutdown = CancellationToken::new();
    let orchestrator = Arc::new(CycleOrchestrator::new(
        PipelineStores::sqlite(&pools),
        Arc::new(DirectorySource::new(config.data_dir.clone())),
        PipelineSettings::from(&config),
        shutdown.clone(),
    ));

    let outcome = dispatch(cli.command, &config, &orchestrator, shutdown).await;
    pools.close().await;
    outcome
}

async fn dispatch(
    command: Command,
    config: &EtlConfig,
    orchestrator: &Arc<CycleOrchestrator>,
    shutdown: CancellationToken,
) -> Result<()> {
    match command {
        Command::Extract { .. } => {
            info!(data_dir = %config.data_dir.display(), "Extracting");
            finish_phase(orchestrator.run_phase(Phase::Extract).await)
        },
        Command::Transform => {
            info!(as_of = %config.as_of(), "Transforming");
            finish_phase(orchestrator.run_phase(Phase::Transform).await)
        },
        Command::Load { entity } => {
            let result = match entity {
                Some(entity) => orchestrator.run_load_for(entity).await,
                None => orchestrator.run_phase(Phase::Load).await,
            };
            finish_phase(result)
        },
        Command::Run => {
            let summary = orchestrator.run_full_cycle().await;
            print_json(&summary)?;
            if !summary.succeeded() {
                bail!(
                    "Cycle did not complete: {}",
                    summary.abort_reason.as_deref().unwrap_or("skipped")
                );
            }
            Ok(())
        },
        Command::Schedule { interval } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.schedule_interval());
            if interval.is_zero() {
                bail!("Schedule interval must be greater than 0 seconds");
            }

            tokio::spawn(shutdown_signal(shutdown));
            let stats = Scheduler::new(orchestrator.clone(), interval).run().await;
            print_json(&stats)
        },
        Command::Export { out } => {
            let dir = out.unwrap_or_else(|| config.export_dir.clone());
            let files = export_transformed(orchestrator.stores().transform.as_ref(), &dir).await?;
            print_json(&files)
        },
        Command::Status => {
            let status = orchestrator.status().await?;
            print_json(&status)
        },
    }
}

fn finish_phase(result: PhaseResult) -> Result<()> {
    print_json(&result)?;
    if result.is_failed() {
        bail!("Phase {} failed", result.phase);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM. The running phase finishes first.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping after the current phase");
        },
        _ = terminate => {
            info!("Received terminate signal, stopping after the current phase");
        },
    }

    token.cancel();
}
