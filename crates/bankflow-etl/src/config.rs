//! Configuration management

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Directory scanned for source CSV files.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Staging tier (raw rows and the ingestion ledger).
pub const DEFAULT_STAGING_DATABASE_URL: &str = "sqlite://bankflow_staging.db?mode=rwc";

/// Transform tier (cleaned rows and quarantine).
pub const DEFAULT_TRANSFORM_DATABASE_URL: &str = "sqlite://bankflow_transform.db?mode=rwc";

/// Production tier.
pub const DEFAULT_PRODUCTION_DATABASE_URL: &str = "sqlite://bankflow_production.db?mode=rwc";

/// Maximum connections per tier pool.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Pool acquire timeout in seconds.
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Rows per staging upsert transaction.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Insert attempts per candidate row within one load call.
pub const DEFAULT_LOAD_MAX_ATTEMPTS: u32 = 3;

/// Base delay between load attempts; attempt `n` waits `n * base`.
pub const DEFAULT_LOAD_RETRY_DELAY_MS: u64 = 200;

/// Scheduler tick.
pub const DEFAULT_SCHEDULE_INTERVAL_SECS: u64 = 60;

/// Target directory for `export`.
pub const DEFAULT_EXPORT_DIR: &str = "./exports";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub data_dir: PathBuf,
    pub database: DatabaseConfig,
    pub batch_size: usize,
    pub load: LoadConfig,
    pub schedule_interval_secs: u64,
    /// Reference date for age and tenure. `None` means today (UTC).
    pub as_of_date: Option<NaiveDate>,
    pub export_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub staging_url: String,
    pub transform_url: String,
    pub production_url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database: DatabaseConfig {
                staging_url: DEFAULT_STAGING_DATABASE_URL.to_string(),
                transform_url: DEFAULT_TRANSFORM_DATABASE_URL.to_string(),
                production_url: DEFAULT_PRODUCTION_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DB_MAX_CONNECTIONS,
                acquire_timeout_secs: DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
            },
            batch_size: DEFAULT_BATCH_SIZE,
            load: LoadConfig {
                max_attempts: DEFAULT_LOAD_MAX_ATTEMPTS,
                retry_delay_ms: DEFAULT_LOAD_RETRY_DELAY_MS,
            },
            schedule_interval_secs: DEFAULT_SCHEDULE_INTERVAL_SECS,
            as_of_date: None,
            export_dir: PathBuf::from(DEFAULT_EXPORT_DIR),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl EtlConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Read `BANKFLOW_*` variables without touching `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        let as_of_date = match std::env::var("BANKFLOW_AS_OF_DATE") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
                    anyhow::anyhow!("BANKFLOW_AS_OF_DATE '{}' is not YYYY-MM-DD: {}", raw, e)
                })?,
            ),
            _ => None,
        };

        let config = EtlConfig {
            data_dir: std::env::var("BANKFLOW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
            database: DatabaseConfig {
                staging_url: std::env::var("BANKFLOW_STAGING_DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_STAGING_DATABASE_URL.to_string()),
                transform_url: std::env::var("BANKFLOW_TRANSFORM_DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_TRANSFORM_DATABASE_URL.to_string()),
                production_url: std::env::var("BANKFLOW_PRODUCTION_DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_PRODUCTION_DATABASE_URL.to_string()),
                max_connections: env_parse(
                    "BANKFLOW_DB_MAX_CONNECTIONS",
                    DEFAULT_DB_MAX_CONNECTIONS,
                ),
                acquire_timeout_secs: env_parse(
                    "BANKFLOW_DB_ACQUIRE_TIMEOUT",
                    DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
                ),
            },
            batch_size: env_parse("BANKFLOW_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            load: LoadConfig {
                max_attempts: env_parse("BANKFLOW_LOAD_MAX_ATTEMPTS", DEFAULT_LOAD_MAX_ATTEMPTS),
                retry_delay_ms: env_parse(
                    "BANKFLOW_LOAD_RETRY_DELAY_MS",
                    DEFAULT_LOAD_RETRY_DELAY_MS,
                ),
            },
            schedule_interval_secs: env_parse(
                "BANKFLOW_SCHEDULE_INTERVAL_SECS",
                DEFAULT_SCHEDULE_INTERVAL_SECS,
            ),
            as_of_date,
            export_dir: std::env::var("BANKFLOW_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_EXPORT_DIR)),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        for (tier, url) in [
            ("staging", &self.database.staging_url),
            ("transform", &self.database.transform_url),
            ("production", &self.database.production_url),
        ] {
            if url.trim().is_empty() {
                anyhow::bail!("The {} database URL cannot be empty", tier);
            }
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.load.max_attempts == 0 {
            anyhow::bail!("Load max_attempts must be at least 1");
        }

        if self.schedule_interval_secs == 0 {
            anyhow::bail!("Schedule interval must be greater than 0 seconds");
        }

        Ok(())
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of_date
            .unwrap_or_else(|| chrono::Utc::now().date_naive())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "BANKFLOW_DATA_DIR",
        "BANKFLOW_BATCH_SIZE",
        "BANKFLOW_LOAD_MAX_ATTEMPTS",
        "BANKFLOW_AS_OF_DATE",
        "BANKFLOW_SCHEDULE_INTERVAL_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EtlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.load.max_attempts, 3);
        assert_eq!(config.schedule_interval(), Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("BANKFLOW_DATA_DIR", "/srv/bank/incoming");
        std::env::set_var("BANKFLOW_BATCH_SIZE", "50");
        std::env::set_var("BANKFLOW_AS_OF_DATE", "2025-03-31");

        let config = EtlConfig::from_env().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/bank/incoming"));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.as_of(), NaiveDate::from_ymd_opt(2025, 3, 31).unwrap());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        std::env::set_var("BANKFLOW_LOAD_MAX_ATTEMPTS", "0");
        assert!(EtlConfig::from_env().is_err());

        clear_env();
        std::env::set_var("BANKFLOW_AS_OF_DATE", "31/03/2025");
        assert!(EtlConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparsable_numbers_fall_back_to_defaults() {
        clear_env();
        std::env::set_var("BANKFLOW_SCHEDULE_INTERVAL_SECS", "soon");
        let config = EtlConfig::from_env().unwrap();
        assert_eq!(config.schedule_interval_secs, DEFAULT_SCHEDULE_INTERVAL_SECS);
        clear_env();
    }
}
