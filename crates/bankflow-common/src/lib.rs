//! Bankflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared building blocks for the Bankflow workspace members:
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Fingerprints**: content hashes used to recognise already-ingested files
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use bankflow_common::fingerprint::Fingerprint;
//!
//! let bytes = std::fs::read("data/customers.csv").unwrap();
//! let fingerprint = Fingerprint::of(&bytes);
//! println!("customers.csv -> {}", fingerprint);
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;

pub use error::{CommonError, Result};
pub use fingerprint::Fingerprint;
