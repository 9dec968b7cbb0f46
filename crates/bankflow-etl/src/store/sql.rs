//! Dynamic SQL shared by the tier stores. Table and column names come from
//! the static entity layouts, never from input data.

use crate::entity::{natural_key_cmp, ColumnKind, Entity};
use crate::error::{EtlError, EtlResult};
use crate::record::{FieldValue, StagingRow, TypedRecord};
use chrono::NaiveDate;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;

pub(super) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

pub(super) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(super) fn typed_column_list(entity: Entity) -> String {
    entity
        .typed_columns()
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(super) fn insert_typed_sql(entity: Entity, table: &str) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        typed_column_list(entity),
        placeholders(entity.typed_columns().len())
    )
}

pub(super) fn select_typed_sql(entity: Entity, table: &str) -> String {
    format!("SELECT {} FROM {}", typed_column_list(entity), table)
}

pub(super) fn bind_field<'q>(query: SqliteQuery<'q>, value: &FieldValue) -> SqliteQuery<'q> {
    match value {
        FieldValue::Null => query.bind(None::<String>),
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Integer(v) => query.bind(*v),
        FieldValue::Real(v) => query.bind(*v),
        FieldValue::Date(d) => query.bind(d.format("%Y-%m-%d").to_string()),
        FieldValue::Boolean(v) => query.bind(*v),
    }
}

pub(super) fn bind_record<'q>(mut query: SqliteQuery<'q>, record: &TypedRecord) -> SqliteQuery<'q> {
    for value in &record.values {
        query = bind_field(query, value);
    }
    query
}

pub(super) fn decode_typed(entity: Entity, table: &str, row: &SqliteRow) -> EtlResult<TypedRecord> {
    let mut values = Vec::with_capacity(entity.typed_columns().len());
    for spec in entity.typed_columns() {
        let value = match spec.kind {
            ColumnKind::Text => row.try_get::<Option<String>, _>(spec.name)?.into(),
            ColumnKind::Integer => row.try_get::<Option<i64>, _>(spec.name)?.into(),
            ColumnKind::Real => row.try_get::<Option<f64>, _>(spec.name)?.into(),
            ColumnKind::Boolean => row.try_get::<Option<bool>, _>(spec.name)?.into(),
            ColumnKind::Date => match row.try_get::<Option<String>, _>(spec.name)? {
                None => FieldValue::Null,
                Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .map(FieldValue::Date)
                    .map_err(|_| EtlError::Decode {
                        table: table.to_string(),
                        column: spec.name.to_string(),
                        value: raw,
                    })?,
            },
        };
        values.push(value);
    }

    let natural_key = values
        .first()
        .and_then(FieldValue::as_text)
        .map(str::to_string)
        .ok_or_else(|| EtlError::Decode {
            table: table.to_string(),
            column: entity.key_column().to_string(),
            value: "NULL".to_string(),
        })?;

    Ok(TypedRecord {
        entity,
        natural_key,
        values,
    })
}

pub(super) fn decode_raw(entity: Entity, row: &SqliteRow) -> EtlResult<StagingRow> {
    let values = entity
        .raw_columns()
        .iter()
        .map(|column| row.try_get::<Option<String>, _>(*column))
        .collect::<Result<Vec<_>, _>>()?;
    let natural_key: String = row.try_get(entity.key_column())?;
    Ok(StagingRow {
        entity,
        natural_key,
        values,
    })
}

pub(super) async fn count_rows(pool: &SqlitePool, table: &str) -> EtlResult<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await?;
    Ok(u64::try_from(count).unwrap_or_default())
}

pub(super) async fn key_set(pool: &SqlitePool, entity: Entity, table: &str) -> EtlResult<HashSet<String>> {
    let keys: Vec<String> =
        sqlx::query_scalar(&format!("SELECT {} FROM {}", entity.key_column(), table))
            .fetch_all(pool)
            .await?;
    Ok(keys.into_iter().collect())
}

pub(super) async fn fetch_typed_by_key(
    pool: &SqlitePool,
    entity: Entity,
    table: &str,
    natural_key: &str,
) -> EtlResult<Option<TypedRecord>> {
    let sql = format!("{} WHERE {} = ?", select_typed_sql(entity, table), entity.key_column());
    let row = sqlx::query(&sql)
        .bind(natural_key)
        .fetch_optional(pool)
        .await?;
    row.map(|row| decode_typed(entity, table, &row)).transpose()
}

pub(super) async fn fetch_typed_all(
    pool: &SqlitePool,
    entity: Entity,
    table: &str,
) -> EtlResult<Vec<TypedRecord>> {
    let rows = sqlx::query(&select_typed_sql(entity, table))
        .fetch_all(pool)
        .await?;
    let mut records = rows
        .iter()
        .map(|row| decode_typed(entity, table, row))
        .collect::<EtlResult<Vec<_>>>()?;
    records.sort_by(|a, b| natural_key_cmp(&a.natural_key, &b.natural_key));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_sql() {
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(
            insert_typed_sql(Entity::Branch, "branches"),
            "INSERT INTO branches (branch_id, branch_name, city, state, manager_name, region) \
             VALUES (?, ?, ?, ?, ?, ?)"
        );
        assert!(select_typed_sql(Entity::Transaction, "transformed_transactions")
            .ends_with("FROM transformed_transactions"));
    }
}
