//! Row representations for the three tiers.

use crate::entity::{ColumnKind, Entity};
use crate::error::{EtlError, EtlResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Raw row as kept in staging: one optional string per source column, aligned
/// with [`Entity::raw_columns`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRow {
    pub entity: Entity,
    pub natural_key: String,
    pub values: Vec<Option<String>>,
}

impl StagingRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.entity
            .raw_columns()
            .iter()
            .position(|c| *c == column)
            .and_then(|idx| self.values.get(idx))
            .and_then(|v| v.as_deref())
    }

    /// Column/value pairs, used when quarantining the row.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .entity
            .raw_columns()
            .iter()
            .zip(&self.values)
            .map(|(column, value)| {
                let value = value
                    .as_ref()
                    .map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.clone()));
                (column.to_string(), value)
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Date(NaiveDate),
    Boolean(bool),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            FieldValue::Real(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    fn matches_kind(&self, kind: ColumnKind) -> bool {
        matches!(
            (self, kind),
            (FieldValue::Null, _)
                | (FieldValue::Text(_), ColumnKind::Text)
                | (FieldValue::Integer(_), ColumnKind::Integer)
                | (FieldValue::Real(_), ColumnKind::Real)
                | (FieldValue::Date(_), ColumnKind::Date)
                | (FieldValue::Boolean(_), ColumnKind::Boolean)
        )
    }

    /// Text form used for CSV export. NULL is written as `NA`.
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Null => "NA".to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(v) => v.to_string(),
            FieldValue::Real(v) => v.to_string(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Boolean(v) => v.to_string(),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// Cleaned, typed row as kept in the transform and production tiers. Values
/// are aligned with [`Entity::typed_columns`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedRecord {
    pub entity: Entity,
    pub natural_key: String,
    pub values: Vec<FieldValue>,
}

impl TypedRecord {
    pub fn builder(entity: Entity) -> RecordBuilder {
        RecordBuilder {
            entity,
            values: vec![FieldValue::Null; entity.typed_columns().len()],
            problem: None,
        }
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.entity
            .typed_columns()
            .iter()
            .position(|c| c.name == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub(crate) fn set(&mut self, column: &str, value: FieldValue) -> bool {
        match self
            .entity
            .typed_columns()
            .iter()
            .position(|c| c.name == column)
        {
            Some(idx) => {
                self.values[idx] = value;
                true
            }
            None => false,
        }
    }
}

pub struct RecordBuilder {
    entity: Entity,
    values: Vec<FieldValue>,
    problem: Option<String>,
}

impl RecordBuilder {
    pub fn set(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        let value = value.into();
        let spec = self
            .entity
            .typed_columns()
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == column);

        match spec {
            Some((idx, spec)) if value.matches_kind(spec.kind) => self.values[idx] = value,
            Some((_, spec)) => {
                self.problem
                    .get_or_insert_with(|| format!("{} expects {:?}, got {:?}", column, spec.kind, value));
            }
            None => {
                self.problem
                    .get_or_insert_with(|| format!("{} has no column '{}'", self.entity, column));
            }
        }
        self
    }

    pub fn build(self) -> EtlResult<TypedRecord> {
        let key_column = self.entity.key_column();
        if let Some(problem) = self.problem {
            return Err(EtlError::Config(problem));
        }
        let natural_key = match self.values.first() {
            Some(FieldValue::Text(key)) if !key.is_empty() => key.clone(),
            _ => {
                return Err(EtlError::Config(format!(
                    "{} record built without {}",
                    self.entity, key_column
                )))
            }
        };
        Ok(TypedRecord {
            entity: self.entity,
            natural_key,
            values: self.values,
        })
    }
}

/// A staging row the transform engine refused, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantinedRow {
    pub entity: Entity,
    pub natural_key: String,
    pub reason: String,
    pub raw: serde_json::Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_places_values_by_column() {
        let record = TypedRecord::builder(Entity::Branch)
            .set("branch_id", "B1")
            .set("region", "South")
            .set("city", None::<String>)
            .build()
            .unwrap();

        assert_eq!(record.natural_key, "B1");
        assert_eq!(record.get("region").and_then(FieldValue::as_text), Some("South"));
        assert!(record.get("city").unwrap().is_null());
        assert!(record.get("nonexistent").is_none());
    }

    #[test]
    fn test_builder_rejects_wrong_kind_and_unknown_column() {
        let wrong_kind = TypedRecord::builder(Entity::Loan)
            .set("loan_id", "L1")
            .set("loan_amount", "lots")
            .build();
        assert!(wrong_kind.is_err());

        let unknown = TypedRecord::builder(Entity::Loan)
            .set("loan_id", "L1")
            .set("colour", "red")
            .build();
        assert!(unknown.is_err());

        let keyless = TypedRecord::builder(Entity::Loan).set("loan_amount", 10.0).build();
        assert!(keyless.is_err());
    }

    #[test]
    fn test_staging_row_lookup_and_json() {
        let row = StagingRow {
            entity: Entity::Branch,
            natural_key: "B1".into(),
            values: vec![
                Some("B1".into()),
                Some("Main".into()),
                None,
                Some("Goa".into()),
                None,
            ],
        };
        assert_eq!(row.get("state"), Some("Goa"));
        assert_eq!(row.get("city"), None);
        let json = row.to_json();
        assert_eq!(json["branch_name"], "Main");
        assert!(json["manager_name"].is_null());
    }

    #[test]
    fn test_cells() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(FieldValue::from(date).to_cell(), "2024-01-05");
        assert_eq!(FieldValue::Null.to_cell(), "NA");
        assert_eq!(FieldValue::from(true).to_cell(), "true");
        assert_eq!(FieldValue::from(1500.5).to_cell(), "1500.5");
    }
}
