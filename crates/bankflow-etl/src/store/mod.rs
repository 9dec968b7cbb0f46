//! Storage tiers.
//!
//! Each tier is a trait so the extractor, transform engine and load
//! reconciler can be exercised against test doubles; the SQLite
//! implementations live in the submodules.

mod production;
mod sql;
mod staging;
mod transform;

pub use production::SqliteProductionStore;
pub use staging::SqliteStagingStore;
pub use transform::SqliteTransformStore;

use crate::entity::Entity;
use crate::error::EtlResult;
use crate::record::{QuarantinedRow, StagingRow, TypedRecord};
use async_trait::async_trait;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl std::ops::AddAssign for UpsertCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The natural key was already present; nothing was written.
    AlreadyPresent,
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Insert or overwrite rows by natural key, atomically.
    async fn upsert_rows(&self, entity: Entity, rows: &[StagingRow]) -> EtlResult<UpsertCounts>;

    /// Every row of the entity, in natural-key order.
    async fn fetch_all(&self, entity: Entity) -> EtlResult<Vec<StagingRow>>;

    async fn count(&self, entity: Entity) -> EtlResult<u64>;
}

#[async_trait]
pub trait TransformStore: Send + Sync {
    /// Replace the entity's rows and quarantine list in one transaction.
    async fn replace_entity(
        &self,
        entity: Entity,
        records: &[TypedRecord],
        quarantined: &[QuarantinedRow],
    ) -> EtlResult<()>;

    async fn natural_keys(&self, entity: Entity) -> EtlResult<HashSet<String>>;

    async fn fetch(&self, entity: Entity, natural_key: &str) -> EtlResult<Option<TypedRecord>>;

    /// Every row of the entity, in natural-key order.
    async fn fetch_all(&self, entity: Entity) -> EtlResult<Vec<TypedRecord>>;

    async fn quarantined(&self, entity: Entity) -> EtlResult<Vec<QuarantinedRow>>;

    async fn count(&self, entity: Entity) -> EtlResult<u64>;
}

/// Append-only from the pipeline's point of view: rows are inserted once and
/// never updated or deleted.
#[async_trait]
pub trait ProductionStore: Send + Sync {
    async fn natural_keys(&self, entity: Entity) -> EtlResult<HashSet<String>>;

    async fn insert(&self, record: &TypedRecord) -> EtlResult<InsertOutcome>;

    async fn fetch(&self, entity: Entity, natural_key: &str) -> EtlResult<Option<TypedRecord>>;

    async fn count(&self, entity: Entity) -> EtlResult<u64>;
}
