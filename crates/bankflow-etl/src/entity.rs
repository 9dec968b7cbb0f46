//! Banking entities and their column layouts in each tier.

use crate::error::{EtlError, EtlResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Branch,
    Customer,
    Loan,
    Transaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    /// ISO `YYYY-MM-DD` stored as text
    Date,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn text(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, kind: ColumnKind::Text }
}

const fn integer(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, kind: ColumnKind::Integer }
}

const fn real(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, kind: ColumnKind::Real }
}

const fn date(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, kind: ColumnKind::Date }
}

const fn boolean(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, kind: ColumnKind::Boolean }
}

const BRANCH_RAW: &[&str] = &["branch_id", "branch_name", "city", "state", "manager_name"];

const CUSTOMER_RAW: &[&str] = &[
    "customer_id",
    "branch_id",
    "first_name",
    "last_name",
    "dob",
    "gender",
    "email",
    "phone",
    "address",
    "account_open_date",
];

const LOAN_RAW: &[&str] = &[
    "loan_id",
    "customer_id",
    "loan_type",
    "loan_amount",
    "interest_rate",
    "start_date",
    "end_date",
    "loan_status",
];

const TRANSACTION_RAW: &[&str] = &[
    "transaction_id",
    "customer_id",
    "transaction_date",
    "transaction_type",
    "amount",
    "balance_after",
    "fraud_flag",
];

const BRANCH_TYPED: &[ColumnSpec] = &[
    text("branch_id"),
    text("branch_name"),
    text("city"),
    text("state"),
    text("manager_name"),
    text("region"),
];

const CUSTOMER_TYPED: &[ColumnSpec] = &[
    text("customer_id"),
    text("branch_id"),
    text("first_name"),
    text("last_name"),
    date("dob"),
    integer("age"),
    text("gender"),
    text("email"),
    text("phone"),
    text("address"),
    date("account_open_date"),
    integer("customer_tenure_days"),
    text("customer_segment"),
    boolean("outlier_flag"),
];

const LOAN_TYPED: &[ColumnSpec] = &[
    text("loan_id"),
    text("customer_id"),
    text("loan_type"),
    real("loan_amount"),
    real("interest_rate"),
    date("start_date"),
    date("end_date"),
    text("loan_status"),
    integer("loan_duration_months"),
    text("risk_category"),
    boolean("outlier_flag"),
];

const TRANSACTION_TYPED: &[ColumnSpec] = &[
    text("transaction_id"),
    text("customer_id"),
    date("transaction_date"),
    text("transaction_type"),
    real("amount"),
    real("balance_after"),
    boolean("fraud_flag"),
    text("transaction_category"),
    boolean("outlier_flag"),
];

impl Entity {
    /// Referential order: parents are extracted, transformed and loaded first.
    pub const ALL: [Entity; 4] = [
        Entity::Branch,
        Entity::Customer,
        Entity::Loan,
        Entity::Transaction,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Entity::Branch => "branches",
            Entity::Customer => "customers",
            Entity::Loan => "loans",
            Entity::Transaction => "transactions",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self {
            Entity::Branch => "branch_id",
            Entity::Customer => "customer_id",
            Entity::Loan => "loan_id",
            Entity::Transaction => "transaction_id",
        }
    }

    /// Source CSV columns, as kept in staging. The key column is first.
    pub fn raw_columns(self) -> &'static [&'static str] {
        match self {
            Entity::Branch => BRANCH_RAW,
            Entity::Customer => CUSTOMER_RAW,
            Entity::Loan => LOAN_RAW,
            Entity::Transaction => TRANSACTION_RAW,
        }
    }

    /// Typed columns shared by the transform and production tiers.
    pub fn typed_columns(self) -> &'static [ColumnSpec] {
        match self {
            Entity::Branch => BRANCH_TYPED,
            Entity::Customer => CUSTOMER_TYPED,
            Entity::Loan => LOAN_TYPED,
            Entity::Transaction => TRANSACTION_TYPED,
        }
    }

    pub fn staging_table(self) -> String {
        format!("staging_{}", self.table_name())
    }

    pub fn transform_table(self) -> String {
        format!("transformed_{}", self.table_name())
    }

    pub fn production_table(self) -> &'static str {
        self.table_name()
    }

    /// Match a source file to an entity by table-name prefix,
    /// e.g. `customers_2024_01.csv`.
    pub fn from_file_name(file_name: &str) -> Option<Entity> {
        let lower = file_name.to_ascii_lowercase();
        Entity::ALL
            .into_iter()
            .find(|entity| lower.starts_with(entity.table_name()))
    }

    /// Match a CSV header to the entity with exactly that column set.
    pub fn from_header<S: AsRef<str>>(header: &[S]) -> Option<Entity> {
        Entity::ALL
            .into_iter()
            .find(|entity| same_column_set(entity.raw_columns(), header))
    }
}

pub(crate) fn same_column_set<S: AsRef<str>>(expected: &[&str], actual: &[S]) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .all(|column| actual.iter().any(|a| a.as_ref().trim() == *column))
}

impl FromStr for Entity {
    type Err = EtlError;

    fn from_str(s: &str) -> EtlResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "branch" | "branches" => Ok(Entity::Branch),
            "customer" | "customers" => Ok(Entity::Customer),
            "loan" | "loans" => Ok(Entity::Loan),
            "transaction" | "transactions" => Ok(Entity::Transaction),
            _ => Err(EtlError::UnknownEntity(s.to_string())),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Ordering for natural keys: by the number formed from their digits, then
/// lexically, so `C2` sorts before `C10`.
pub fn natural_key_cmp(a: &str, b: &str) -> Ordering {
    numeric_part(a)
        .cmp(&numeric_part(b))
        .then_with(|| a.cmp(b))
}

fn numeric_part(key: &str) -> Option<u128> {
    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_singular_and_plural() {
        assert_eq!("customer".parse::<Entity>().unwrap(), Entity::Customer);
        assert_eq!("Loans".parse::<Entity>().unwrap(), Entity::Loan);
        assert!(matches!(
            "accounts".parse::<Entity>(),
            Err(EtlError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_key_column_leads_every_layout() {
        for entity in Entity::ALL {
            assert_eq!(entity.raw_columns()[0], entity.key_column());
            assert_eq!(entity.typed_columns()[0].name, entity.key_column());
            for raw in entity.raw_columns() {
                assert!(
                    entity.typed_columns().iter().any(|c| c.name == *raw),
                    "{entity}.{raw} missing from typed layout"
                );
            }
        }
    }

    #[test]
    fn test_file_name_and_header_matching() {
        assert_eq!(Entity::from_file_name("customers_jan.csv"), Some(Entity::Customer));
        assert_eq!(Entity::from_file_name("Transactions.csv"), Some(Entity::Transaction));
        assert_eq!(Entity::from_file_name("jan.csv"), None);

        let header = ["loan_status", "loan_id", "customer_id", "loan_type", "loan_amount",
            "interest_rate", "start_date", "end_date"];
        assert_eq!(Entity::from_header(&header), Some(Entity::Loan));
        assert_eq!(Entity::from_header(&["loan_id", "customer_id"]), None);
    }

    #[test]
    fn test_natural_key_order() {
        let mut keys = vec!["C10", "C2", "C1", "B7", "X"];
        keys.sort_by(|a, b| natural_key_cmp(a, b));
        assert_eq!(keys, vec!["X", "C1", "C2", "B7", "C10"]);
    }
}
