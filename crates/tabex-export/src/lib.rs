//! Tabex Export Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Exports relational tables to directories of columnar part files.
//!
//! # Overview
//!
//! - **Sources**: live databases (`source::CursorAdapter`), SQL dumps
//!   (`source::DumpAdapter`) and delimited files (`source::FileAdapter`),
//!   all behind the [`source::SourceAdapter`] trait
//! - **Schema**: the first batch of a table fixes its column names and
//!   types ([`schema::SchemaResolver`]); later batches must conform
//! - **Output**: every batch becomes one `part-NNNNN.parquet` file, written
//!   to a temporary name and renamed into place ([`writer::PartWriter`])
//! - **Orchestration**: tables run as independent units on a bounded pool
//!   ([`orchestrator::Orchestrator`]); one failing table never stops the
//!   others
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tabex_export::{
//!     plan, DelimitedOptions, ExportConfig, Orchestrator, SourceContext, TableSelector,
//! };
//!
//! # async fn run() -> tabex_export::Result<()> {
//! let options = DelimitedOptions::default();
//! let tables = plan::plan_files(
//!     Path::new("./data"),
//!     &options,
//!     &TableSelector::all(),
//!     Path::new("./out"),
//! )
//! .await?;
//!
//! let context = SourceContext::default().with_file_options(options);
//! let report = Orchestrator::new(ExportConfig::default(), Arc::new(context))
//!     .export(tables)
//!     .await?;
//! println!("{}", report.render_table());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod report;
pub mod schema;
pub mod selector;
pub mod source;
pub mod unit;
pub mod writer;

// Re-export commonly used types
pub use codec::{ColumnarCodec, Compression, ParquetCodec};
pub use config::{DatabaseSettings, ExportConfig, RetryPolicy};
pub use db::{Database, SqlxDatabase};
pub use error::{ErrorKind, ExportError, Result};
pub use model::{ExportOutcome, PartFile, RowBatch, SourceRef, TableDescriptor, Value};
pub use orchestrator::Orchestrator;
pub use report::ExportReport;
pub use schema::{ColumnSchema, ColumnType, SchemaResolver};
pub use selector::TableSelector;
pub use source::{
    AdapterFactory, DelimitedOptions, DumpDocument, SourceAdapter, SourceContext,
};
