//! Connection pools and schema migrations for the three storage tiers.

use crate::config::DatabaseConfig;
use crate::error::EtlResult;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Staging,
    Transform,
    Production,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Staging => "staging",
            Tier::Transform => "transform",
            Tier::Production => "production",
        }
    }

    fn migrator(self) -> Migrator {
        let mut migrator = match self {
            Tier::Staging => sqlx::migrate!("./migrations/staging"),
            Tier::Transform => sqlx::migrate!("./migrations/transform"),
            Tier::Production => sqlx::migrate!("./migrations/production"),
        };
        // Tiers may share one database file; each only knows its own migrations.
        migrator.set_ignore_missing(true);
        migrator
    }
}

/// One pool per tier.
#[derive(Debug, Clone)]
pub struct TierPools {
    pub staging: SqlitePool,
    pub transform: SqlitePool,
    pub production: SqlitePool,
}

impl TierPools {
    /// Connect all tiers and bring their schemas up to date.
    pub async fn connect(config: &DatabaseConfig) -> EtlResult<Self> {
        let pools = Self {
            staging: create_pool(&config.staging_url, config).await?,
            transform: create_pool(&config.transform_url, config).await?,
            production: create_pool(&config.production_url, config).await?,
        };
        pools.migrate().await?;
        Ok(pools)
    }

    /// Fresh in-memory databases, one per tier.
    pub async fn in_memory() -> EtlResult<Self> {
        let pools = Self {
            staging: memory_pool().await?,
            transform: memory_pool().await?,
            production: memory_pool().await?,
        };
        pools.migrate().await?;
        Ok(pools)
    }

    pub async fn migrate(&self) -> EtlResult<()> {
        for (tier, pool) in [
            (Tier::Staging, &self.staging),
            (Tier::Transform, &self.transform),
            (Tier::Production, &self.production),
        ] {
            tier.migrator().run(pool).await?;
            info!(tier = tier.as_str(), "Schema migrations applied");
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.staging.close().await;
        self.transform.close().await;
        self.production.close().await;
    }
}

pub async fn create_pool(url: &str, config: &DatabaseConfig) -> EtlResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(config.acquire_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect_with(options)
        .await?;

    info!(
        url,
        max_connections = config.max_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Single-connection pool over a private in-memory database.
async fn memory_pool() -> EtlResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

pub async fn health_check(pool: &SqlitePool) -> EtlResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
