//! Error types shared across Bankflow crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid fingerprint '{value}': {reason}")]
    InvalidFingerprint { value: String, reason: String },
}
