//! Core data model: values, row batches, table descriptors and outcomes

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, ExportError};

// ============================================================================
// Values and Batches
// ============================================================================

/// One cell value as delivered by a source adapter
///
/// Adapters emit `Text` for anything they cannot type themselves; the
/// schema resolver decides what the text means. `Decimal` only appears after
/// a batch has been conformed to a schema and holds the unscaled integer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(i128),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

pub type Row = Vec<Value>;

/// A bounded group of rows pulled from a source in one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Values of one column, top to bottom; short rows yield nothing
    pub fn column(&self, index: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().filter_map(move |row| row.get(index))
    }
}

// ============================================================================
// Table Descriptors
// ============================================================================

/// Where the rows of one logical table come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// A table in the live database, optionally paged by a keyset column
    Query {
        table: String,
        order_key: Option<String>,
    },
    /// A table whose rows are `INSERT` statements in a SQL dump
    Dump { table: String },
    /// One or more delimited text files read in order
    Files { paths: Vec<PathBuf> },
}

impl SourceRef {
    pub fn kind_str(&self) -> &'static str {
        match self {
            SourceRef::Query { .. } => "query",
            SourceRef::Dump { .. } => "dump",
            SourceRef::Files { .. } => "files",
        }
    }
}

/// One unit of export work; immutable once created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub source: SourceRef,
    pub output_dir: PathBuf,
}

impl TableDescriptor {
    /// Describe a table whose parts land in `output_root/<name>`
    pub fn new(name: impl Into<String>, source: SourceRef, output_root: &Path) -> Self {
        let name = name.into();
        let output_dir = output_root.join(table_dir_name(&name));
        Self {
            name,
            source,
            output_dir,
        }
    }
}

/// Directory name for a table: path separators and control characters
/// are replaced so a table can never escape the output root.
pub fn table_dir_name(table: &str) -> String {
    let cleaned: String = table
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

// ============================================================================
// Part Files and Outcomes
// ============================================================================

/// One encoded part file that has been atomically published
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartFile {
    pub sequence: u64,
    pub path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
}

/// Terminal result of one export unit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExportOutcome {
    Succeeded {
        table: String,
        rows: u64,
        parts: u64,
    },
    /// `rows`/`parts` count what was already written before the failure;
    /// those parts stay on disk.
    Failed {
        table: String,
        kind: ErrorKind,
        error: String,
        rows: u64,
        parts: u64,
    },
}

impl ExportOutcome {
    pub fn failed(table: impl Into<String>, error: &ExportError, rows: u64, parts: u64) -> Self {
        ExportOutcome::Failed {
            table: table.into(),
            kind: error.kind(),
            error: error.to_string(),
            rows,
            parts,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            ExportOutcome::Succeeded { table, .. } | ExportOutcome::Failed { table, .. } => table,
        }
    }

    pub fn rows(&self) -> u64 {
        match self {
            ExportOutcome::Succeeded { rows, .. } | ExportOutcome::Failed { rows, .. } => *rows,
        }
    }

    pub fn parts(&self) -> u64 {
        match self {
            ExportOutcome::Succeeded { parts, .. } | ExportOutcome::Failed { parts, .. } => *parts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExportOutcome::Succeeded { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExportOutcome::Failed { kind, .. } => Some(*kind),
            ExportOutcome::Succeeded { .. } => None,
        }
    }
}
