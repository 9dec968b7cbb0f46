use super::sql::{bind_record, count_rows, fetch_typed_all, fetch_typed_by_key, insert_typed_sql, key_set};
use super::TransformStore;
use crate::entity::{natural_key_cmp, Entity};
use crate::error::EtlResult;
use crate::record::{QuarantinedRow, TypedRecord};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Transform tier: `transformed_<entity>` tables plus `transform_quarantine`.
#[derive(Debug, Clone)]
pub struct SqliteTransformStore {
    pool: SqlitePool,
}

impl SqliteTransformStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransformStore for SqliteTransformStore {
    #[instrument(skip(self, records, quarantined), fields(entity = %entity, records = records.len(), quarantined = quarantined.len()))]
    async fn replace_entity(
        &self,
        entity: Entity,
        records: &[TypedRecord],
        quarantined: &[QuarantinedRow],
    ) -> EtlResult<()> {
        let table = entity.transform_table();
        let insert = insert_typed_sql(entity, &table);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
        for record in records {
            bind_record(sqlx::query(&insert), record)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM transform_quarantine WHERE entity = ?")
            .bind(entity.table_name())
            .execute(&mut *tx)
            .await?;
        for row in quarantined {
            sqlx::query(
                "INSERT INTO transform_quarantine (entity, natural_key, reason, raw_row)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(entity, natural_key) DO UPDATE SET reason = excluded.reason,
                     raw_row = excluded.raw_row",
            )
            .bind(entity.table_name())
            .bind(&row.natural_key)
            .bind(&row.reason)
            .bind(serde_json::to_string(&row.raw)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Transform tier replaced");
        Ok(())
    }

    async fn natural_keys(&self, entity: Entity) -> EtlResult<HashSet<String>> {
        key_set(&self.pool, entity, &entity.transform_table()).await
    }

    async fn fetch(&self, entity: Entity, natural_key: &str) -> EtlResult<Option<TypedRecord>> {
        fetch_typed_by_key(&self.pool, entity, &entity.transform_table(), natural_key).await
    }

    async fn fetch_all(&self, entity: Entity) -> EtlResult<Vec<TypedRecord>> {
        fetch_typed_all(&self.pool, entity, &entity.transform_table()).await
    }

    async fn quarantined(&self, entity: Entity) -> EtlResult<Vec<QuarantinedRow>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT natural_key, reason, raw_row FROM transform_quarantine WHERE entity = ?",
        )
        .bind(entity.table_name())
        .fetch_all(&self.pool)
        .await?;

        let mut quarantined = rows
            .into_iter()
            .map(|(natural_key, reason, raw)| -> EtlResult<QuarantinedRow> {
                Ok(QuarantinedRow {
                    entity,
                    natural_key,
                    reason,
                    raw: serde_json::from_str(&raw)?,
                })
            })
            .collect::<EtlResult<Vec<_>>>()?;
        quarantined.sort_by(|a, b| natural_key_cmp(&a.natural_key, &b.natural_key));
        Ok(quarantined)
    }

    async fn count(&self, entity: Entity) -> EtlResult<u64> {
        count_rows(&self.pool, &entity.transform_table()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::TierPools;
    use chrono::NaiveDate;

    fn customer(id: &str, segment: &str) -> TypedRecord {
        TypedRecord::builder(Entity::Customer)
            .set("customer_id", id)
            .set("first_name", "Asha")
            .set("dob", NaiveDate::from_ymd_opt(1990, 5, 17).unwrap())
            .set("age", 34_i64)
            .set("customer_segment", segment)
            .set("outlier_flag", false)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_replace_is_total() {
        let pools = TierPools::in_memory().await.unwrap();
        let store = SqliteTransformStore::new(pools.transform);

        store
            .replace_entity(Entity::Customer, &[customer("C1", "New"), customer("C2", "VIP")], &[])
            .await
            .unwrap();
        store
            .replace_entity(Entity::Customer, &[customer("C2", "Regular")], &[])
            .await
            .unwrap();

        let keys = store.natural_keys(Entity::Customer).await.unwrap();
        assert_eq!(keys, HashSet::from(["C2".to_string()]));

        let c2 = store.fetch(Entity::Customer, "C2").await.unwrap().unwrap();
        assert_eq!(c2, customer("C2", "Regular"));
        assert!(store.fetch(Entity::Customer, "C1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quarantine_round_trip() {
        let pools = TierPools::in_memory().await.unwrap();
        let store = SqliteTransformStore::new(pools.transform);
        let bad = QuarantinedRow {
            entity: Entity::Loan,
            natural_key: "L9".into(),
            reason: "loan_amount must be positive".into(),
            raw: serde_json::json!({ "loan_id": "L9", "loan_amount": "-5" }),
        };

        store.replace_entity(Entity::Loan, &[], &[bad.clone()]).await.unwrap();
        assert_eq!(store.quarantined(Entity::Loan).await.unwrap(), vec![bad]);
        assert!(store.quarantined(Entity::Transaction).await.unwrap().is_empty());

        store.replace_entity(Entity::Loan, &[], &[]).await.unwrap();
        assert!(store.quarantined(Entity::Loan).await.unwrap().is_empty());
    }
}
