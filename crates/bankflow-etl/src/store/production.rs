use super::sql::{bind_record, count_rows, fetch_typed_by_key, insert_typed_sql, key_set};
use super::{InsertOutcome, ProductionStore};
use crate::entity::Entity;
use crate::error::{EtlError, EtlResult};
use crate::record::TypedRecord;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::collections::HashSet;
use tracing::{instrument, warn};

/// Production tier. Inserts only; the primary key on every table turns a
/// concurrent duplicate into [`InsertOutcome::AlreadyPresent`].
#[derive(Debug, Clone)]
pub struct SqliteProductionStore {
    pool: SqlitePool,
}

impl SqliteProductionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductionStore for SqliteProductionStore {
    async fn natural_keys(&self, entity: Entity) -> EtlResult<HashSet<String>> {
        key_set(&self.pool, entity, entity.production_table()).await
    }

    #[instrument(skip(self, record), fields(entity = %record.entity, key = %record.natural_key))]
    async fn insert(&self, record: &TypedRecord) -> EtlResult<InsertOutcome> {
        let sql = insert_typed_sql(record.entity, record.entity.production_table());
        match bind_record(sqlx::query(&sql), record).execute(&self.pool).await {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) => match EtlError::from(e) {
                e if e.is_unique_violation() => {
                    warn!("Natural key already present in production, leaving existing row");
                    Ok(InsertOutcome::AlreadyPresent)
                }
                e => Err(e),
            },
        }
    }

    async fn fetch(&self, entity: Entity, natural_key: &str) -> EtlResult<Option<TypedRecord>> {
        fetch_typed_by_key(&self.pool, entity, entity.production_table(), natural_key).await
    }

    async fn count(&self, entity: Entity) -> EtlResult<u64> {
        count_rows(&self.pool, entity.production_table()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::TierPools;

    #[tokio::test]
    async fn test_duplicate_key_is_not_an_error() {
        let pools = TierPools::in_memory().await.unwrap();
        let store = SqliteProductionStore::new(pools.production);
        let first = TypedRecord::builder(Entity::Transaction)
            .set("transaction_id", "T1")
            .set("amount", 250.0)
            .set("fraud_flag", true)
            .build()
            .unwrap();
        let mut second = first.clone();
        second.set("amount", 999.0.into());

        assert_eq!(store.insert(&first).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&second).await.unwrap(), InsertOutcome::AlreadyPresent);

        let stored = store.fetch(Entity::Transaction, "T1").await.unwrap().unwrap();
        assert_eq!(stored.get("amount").and_then(|v| v.as_real()), Some(250.0));
        assert_eq!(stored.get("fraud_flag").and_then(|v| v.as_bool()), Some(true));
        assert_eq!(store.count(Entity::Transaction).await.unwrap(), 1);
    }
}
