//! Tabex Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the Tabex workspace.
//!
//! # Overview
//!
//! - **Error Handling**: `CommonError` and the crate `Result` alias
//! - **Checksums**: SHA-256 digests for written part files
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use tabex_common::checksum::sha256_file;
//!
//! fn print_digest(path: &str) -> tabex_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     println!("part digest: {}", digest);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
