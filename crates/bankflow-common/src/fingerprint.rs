//! Content fingerprints for source files.
//!
//! A fingerprint is the lowercase hex SHA-256 digest of a file's bytes. It
//! depends only on content, so a renamed copy of a file maps to the same
//! fingerprint while an edited file with an unchanged name does not.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint raw file content.
    pub fn of(content: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(content)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for Fingerprint {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| CommonError::InvalidFingerprint {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        if s.len() != SHA256_HEX_LEN {
            return Err(invalid("expected 64 hex characters"));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(invalid("expected lowercase hex digits"));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
