//! Error types for the export pipeline
//!
//! Every variant is scoped to a single export unit except `Connection` and
//! `Config`, which abort a run before any unit starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Error, Debug)]
pub enum ExportError {
    /// Source unreachable or authentication failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Extraction from a source failed (I/O, query or parse failure)
    #[error("Adapter error: {reason}")]
    Adapter { reason: String },

    /// A batch disagrees with the table's frozen schema
    #[error("Schema conflict in column '{column}' at row {row}: {detail}")]
    SchemaConflict {
        column: String,
        row: u64,
        detail: String,
    },

    /// The columnar codec rejected a batch
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("IO error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Export cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExportError {
    pub fn adapter(reason: impl Into<String>) -> Self {
        ExportError::Adapter {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        ExportError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::Connection(_) => ErrorKind::Connection,
            ExportError::Adapter { .. } => ErrorKind::Adapter,
            ExportError::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            ExportError::Encode(_) => ErrorKind::Encode,
            ExportError::Io { .. } => ErrorKind::Io,
            ExportError::Cancelled => ErrorKind::Cancelled,
            ExportError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<sqlx::Error> for ExportError {
    fn from(err: sqlx::Error) -> Self {
        ExportError::adapter(format!("database query failed: {}", err))
    }
}

impl From<csv_async::Error> for ExportError {
    fn from(err: csv_async::Error) -> Self {
        ExportError::adapter(format!("delimited read failed: {}", err))
    }
}

impl From<parquet::errors::ParquetError> for ExportError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        ExportError::Encode(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for ExportError {
    fn from(err: arrow::error::ArrowError) -> Self {
        ExportError::Encode(err.to_string())
    }
}

/// Stable error category reported per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Adapter,
    SchemaConflict,
    Encode,
    Io,
    Cancelled,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Adapter => "adapter",
            ErrorKind::SchemaConflict => "schema_conflict",
            ErrorKind::Encode => "encode",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
