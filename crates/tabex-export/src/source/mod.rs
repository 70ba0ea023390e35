//! Source adapters
//!
//! Every source kind (live database, SQL dump, delimited files) is exposed
//! through the same pull interface so one export unit state machine drives
//! all of them:
//!
//! 1. `open` acquires the underlying handle
//! 2. `next_batch(capacity)` yields at most `capacity` rows, or `None` at end
//! 3. `close` releases the handle, and is called even after a failed pull

pub mod cursor;
pub mod dump;
pub mod file;
pub mod tokenizer;

use async_trait::async_trait;
use std::sync::Arc;

use crate::db::Database;
use crate::error::{ExportError, Result};
use crate::model::{RowBatch, SourceRef, TableDescriptor};
use crate::schema::SchemaHints;

pub use cursor::CursorAdapter;
pub use dump::{DumpAdapter, DumpDocument};
pub use file::{DelimitedOptions, FileAdapter};

/// Pull-based producer of bounded row batches for one table
#[async_trait]
pub trait SourceAdapter: Send {
    async fn open(&mut self) -> Result<()>;

    /// Next batch of at most `capacity` rows; `None` once the source is
    /// exhausted
    async fn next_batch(&mut self, capacity: usize) -> Result<Option<RowBatch>>;

    async fn close(&mut self) -> Result<()>;

    /// Row count estimate for progress reporting, known after `open`
    fn estimated_rows(&self) -> Option<u64> {
        None
    }

    /// Declared column names and types, known after `open`
    fn schema_hints(&self) -> SchemaHints {
        SchemaHints::default()
    }
}

/// Builds the adapter for a table descriptor when its unit starts
pub trait AdapterFactory: Send + Sync {
    fn create(&self, descriptor: &TableDescriptor) -> Result<Box<dyn SourceAdapter>>;
}

/// Shared resources adapters are built from
///
/// One context serves a whole run: cursor adapters share the pool, dump
/// adapters share the parsed document.
#[derive(Clone, Default)]
pub struct SourceContext {
    pub database: Option<Arc<dyn Database>>,
    pub dump: Option<Arc<DumpDocument>>,
    pub file_options: DelimitedOptions,
}

impl SourceContext {
    pub fn with_database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_dump(mut self, dump: Arc<DumpDocument>) -> Self {
        self.dump = Some(dump);
        self
    }

    pub fn with_file_options(mut self, options: DelimitedOptions) -> Self {
        self.file_options = options;
        self
    }
}

impl AdapterFactory for SourceContext {
    fn create(&self, descriptor: &TableDescriptor) -> Result<Box<dyn SourceAdapter>> {
        match &descriptor.source {
            SourceRef::Query { table, order_key } => {
                let database = self.database.clone().ok_or_else(|| {
                    ExportError::Config(format!(
                        "table '{}' needs a database connection",
                        descriptor.name
                    ))
                })?;
                Ok(Box::new(CursorAdapter::new(
                    database,
                    table.clone(),
                    order_key.clone(),
                )))
            },
            SourceRef::Dump { table } => {
                let document = self.dump.clone().ok_or_else(|| {
                    ExportError::Config(format!("table '{}' needs a SQL dump", descriptor.name))
                })?;
                Ok(Box::new(DumpAdapter::new(document, table.clone())))
            },
            SourceRef::Files { paths } => Ok(Box::new(FileAdapter::new(
                paths.clone(),
                self.file_options.clone(),
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_missing_resource_is_config_error() {
        let context = SourceContext::default();
        let descriptor = TableDescriptor::new(
            "users",
            SourceRef::Query {
                table: "users".to_string(),
                order_key: None,
            },
            Path::new("/tmp/out"),
        );
        let err = context.create(&descriptor).err().unwrap();
        assert!(matches!(err, ExportError::Config(_)));
    }

    #[test]
    fn test_dump_adapter_from_context() {
        let document = Arc::new(DumpDocument::from_text(
            "INSERT INTO t VALUES (1);".to_string(),
        ));
        let context = SourceContext::default().with_dump(document);
        let descriptor = TableDescriptor::new(
            "t",
            SourceRef::Dump {
                table: "t".to_string(),
            },
            Path::new("/tmp/out"),
        );
        assert!(context.create(&descriptor).is_ok());
    }
}
