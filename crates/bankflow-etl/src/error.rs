//! Pipeline error taxonomy

use crate::entity::Entity;
use bankflow_common::CommonError;
use thiserror::Error;

pub type EtlResult<T> = Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    /// The fingerprint is already in the ledger. Benign under retries: Extract
    /// treats it as a skip.
    #[error("File '{path}' (fingerprint {fingerprint}) has already been ingested")]
    DuplicateIngestion { fingerprint: String, path: String },

    /// A single staging row could not be cleaned or enriched. The row is
    /// quarantined and the batch continues.
    #[error("{entity} row '{natural_key}' could not be transformed: {reason}")]
    RowTransform {
        entity: Entity,
        natural_key: String,
        reason: String,
    },

    /// A candidate row still failed after the bounded retries.
    #[error("{entity} row '{natural_key}' failed to load after {attempts} attempt(s): {message}")]
    RowLoad {
        entity: Entity,
        natural_key: String,
        attempts: u32,
        message: String,
    },

    #[error("{phase} phase aborted: {message}")]
    PhaseFatal { phase: String, message: String },

    #[error("Source file '{path}' rejected: {reason}")]
    SchemaMismatch { path: String, reason: String },

    #[error("Unknown entity '{0}'. Expected one of: branches, customers, loans, transactions")]
    UnknownEntity(String),

    #[error("Stored value for {table}.{column} could not be decoded: {value}")]
    Decode {
        table: String,
        column: String,
        value: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EtlError {
    pub fn row_transform(entity: Entity, natural_key: &str, reason: impl Into<String>) -> Self {
        Self::RowTransform {
            entity,
            natural_key: natural_key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn phase_fatal(phase: impl Into<String>, message: impl ToString) -> Self {
        Self::PhaseFatal {
            phase: phase.into(),
            message: message.to_string(),
        }
    }

    /// Errors that mean the store itself is unusable, as opposed to a single
    /// bad file or row.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PhaseFatal { .. }
                | Self::Database(_)
                | Self::Migration(_)
                | Self::Io(_)
                | Self::Decode { .. }
                | Self::Config(_)
        )
    }

    /// True when the underlying database error is a unique-key violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let dup = EtlError::DuplicateIngestion {
            fingerprint: "ab".into(),
            path: "jan.csv".into(),
        };
        assert!(!dup.is_fatal());
        assert!(!EtlError::row_transform(Entity::Loan, "L1", "amount must be positive").is_fatal());
        assert!(EtlError::phase_fatal("load", "connection refused").is_fatal());
        assert!(EtlError::Database(sqlx::Error::PoolTimedOut).is_fatal());
        assert!(!EtlError::Database(sqlx::Error::PoolTimedOut).is_unique_violation());
    }

    #[test]
    fn test_messages_name_the_row() {
        let err = EtlError::RowLoad {
            entity: Entity::Customer,
            natural_key: "C7".into(),
            attempts: 3,
            message: "database is locked".into(),
        };
        assert_eq!(
            err.to_string(),
            "customers row 'C7' failed to load after 3 attempt(s): database is locked"
        );
    }
}
