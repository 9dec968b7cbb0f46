use super::sql::{count_rows, decode_raw};
use super::{StagingStore, UpsertCounts};
use crate::entity::{natural_key_cmp, Entity};
use crate::error::EtlResult;
use crate::record::StagingRow;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, instrument};

/// Raw rows in `staging_<entity>` tables, upserted by natural key.
#[derive(Debug, Clone)]
pub struct SqliteStagingStore {
    pool: SqlitePool,
}

impl SqliteStagingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn upsert_sql(entity: Entity) -> String {
    let columns = entity.raw_columns();
    let updates = columns[1..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({cols}) VALUES ({params})
         ON CONFLICT({key}) DO UPDATE SET {updates},
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        table = entity.staging_table(),
        cols = columns.join(", "),
        params = super::sql::placeholders(columns.len()),
        key = entity.key_column(),
    )
}

#[async_trait]
impl StagingStore for SqliteStagingStore {
    #[instrument(skip(self, rows), fields(entity = %entity, rows = rows.len()))]
    async fn upsert_rows(&self, entity: Entity, rows: &[StagingRow]) -> EtlResult<UpsertCounts> {
        let upsert = upsert_sql(entity);
        let exists = format!(
            "SELECT 1 FROM {} WHERE {} = ?",
            entity.staging_table(),
            entity.key_column()
        );

        let mut counts = UpsertCounts::default();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let existing: Option<i64> = sqlx::query_scalar(&exists)
                .bind(&row.natural_key)
                .fetch_optional(&mut *tx)
                .await?;

            let mut query = sqlx::query(&upsert);
            for value in &row.values {
                query = query.bind(value.clone());
            }
            query.execute(&mut *tx).await?;

            if existing.is_some() {
                counts.updated += 1;
            } else {
                counts.inserted += 1;
            }
        }

        tx.commit().await?;
        debug!(inserted = counts.inserted, updated = counts.updated, "Staging batch committed");
        Ok(counts)
    }

    async fn fetch_all(&self, entity: Entity) -> EtlResult<Vec<StagingRow>> {
        let sql = format!(
            "SELECT {} FROM {}",
            entity.raw_columns().join(", "),
            entity.staging_table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut staged = rows
            .iter()
            .map(|row| decode_raw(entity, row))
            .collect::<EtlResult<Vec<_>>>()?;
        staged.sort_by(|a, b| natural_key_cmp(&a.natural_key, &b.natural_key));
        Ok(staged)
    }

    async fn count(&self, entity: Entity) -> EtlResult<u64> {
        count_rows(&self.pool, &entity.staging_table()).await
    }
}
