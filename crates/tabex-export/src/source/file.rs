//! Delimited text file source
//!
//! One table is one file or an ordered set of files with identical layout.
//! Files are opened one at a time and streamed record by record, so a batch
//! is the only buffered data.

use async_trait::async_trait;
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::debug;

use super::SourceAdapter;
use crate::error::{ExportError, Result};
use crate::model::{RowBatch, Value};
use crate::schema::SchemaHints;

/// Parsing options for delimited files
///
/// ```ignore
/// let options = DelimitedOptions::new()
///     .with_delimiter(b'\t')
///     .with_has_header(false);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedOptions {
    /// Field delimiter byte (default: `,`)
    pub delimiter: u8,
    /// Whether each file starts with a header row (default: `true`)
    pub has_header: bool,
    /// Quote character; `None` disables quoting (default: `"`)
    pub quote: Option<u8>,
    /// Escape character; `None` means doubled quotes (default)
    pub escape: Option<u8>,
    /// Extensions picked up when a directory is scanned
    pub extensions: Vec<String>,
}

impl Default for DelimitedOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            quote: Some(b'"'),
            escape: None,
            extensions: vec!["csv".to_string(), "tsv".to_string(), "txt".to_string()],
        }
    }
}

impl DelimitedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_has_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_quote(mut self, quote: Option<u8>) -> Self {
        self.quote = quote;
        self
    }

    pub fn with_escape(mut self, escape: Option<u8>) -> Self {
        self.escape = escape;
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Whether `path` has one of the configured extensions (case-insensitive)
    pub fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    fn reader_builder(&self) -> AsyncReaderBuilder {
        let mut builder = AsyncReaderBuilder::new();
        builder
            .delimiter(self.delimiter)
            .has_headers(self.has_header)
            .flexible(true)
            .escape(self.escape);
        match self.quote {
            Some(quote) => builder.quote(quote),
            None => builder.quoting(false),
        };
        builder
    }
}

pub struct FileAdapter {
    paths: Vec<PathBuf>,
    options: DelimitedOptions,
    reader: Option<AsyncReader<File>>,
    next_path: usize,
    header: Option<Vec<String>>,
    record: StringRecord,
}

impl FileAdapter {
    pub fn new(paths: Vec<PathBuf>, options: DelimitedOptions) -> Self {
        Self {
            paths,
            options,
            reader: None,
            next_path: 0,
            header: None,
            record: StringRecord::new(),
        }
    }

    async fn open_next_file(&mut self) -> Result<()> {
        let Some(path) = self.paths.get(self.next_path).cloned() else {
            return Ok(());
        };
        self.next_path += 1;

        let file = File::open(&path).await.map_err(|e| {
            ExportError::adapter(format!("cannot open {}: {}", path.display(), e))
        })?;
        let mut reader = self.options.reader_builder().create_reader(file);

        if self.options.has_header {
            let header: Vec<String> = reader.headers().await?.iter().map(str::to_string).collect();
            match &self.header {
                Some(first) if *first != header => {
                    return Err(ExportError::adapter(format!(
                        "header of {} differs from the first file",
                        path.display()
                    )))
                },
                Some(_) => {},
                None => self.header = Some(header),
            }
        }

        debug!(path = %path.display(), "Reading delimited file");
        self.reader = Some(reader);
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for FileAdapter {
    async fn open(&mut self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(ExportError::adapter("no input files"));
        }
        self.next_path = 0;
        self.header = None;
        self.open_next_file().await
    }

    async fn next_batch(&mut self, capacity: usize) -> Result<Option<RowBatch>> {
        let mut batch = RowBatch::with_capacity(capacity.min(4096));

        while batch.len() < capacity {
            let Some(reader) = self.reader.as_mut() else {
                if self.next_path >= self.paths.len() {
                    break;
                }
                self.open_next_file().await?;
                continue;
            };

            if reader.read_record(&mut self.record).await? {
                batch.push(self.record.iter().map(Value::text).collect());
            } else {
                self.reader = None;
            }
        }

        Ok((!batch.is_empty()).then_some(batch))
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        self.next_path = self.paths.len();
        Ok(())
    }

    fn schema_hints(&self) -> SchemaHints {
        match &self.header {
            Some(names) => SchemaHints::with_names(names.clone()),
            None => SchemaHints::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn drain(adapter: &mut FileAdapter, capacity: usize) -> Vec<RowBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = adapter.next_batch(capacity).await.unwrap() {
            assert!(batch.len() <= capacity);
            batches.push(batch);
        }
        batches
    }

    #[tokio::test]
    async fn test_header_and_quoted_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.csv", "id,name\n1,\"x, y\"\n2,z\n");

        let mut adapter = FileAdapter::new(vec![path], DelimitedOptions::default());
        adapter.open().await.unwrap();
        let batches = drain(&mut adapter, 10).await;
        adapter.close().await.unwrap();

        assert_eq!(
            adapter.schema_hints().names,
            Some(vec!["id".to_string(), "name".to_string()])
        );
        assert_eq!(
            batches[0].rows(),
            &[
                vec![Value::text("1"), Value::text("x, y")],
                vec![Value::text("2"), Value::text("z")],
            ]
        );
    }

    #[tokio::test]
    async fn test_files_stream_in_order_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let first = write(dir.path(), "1.tsv", "1\ta\n2\tb\n3\tc\n");
        let second = write(dir.path(), "2.tsv", "4\td\n");

        let options = DelimitedOptions::new()
            .with_delimiter(b'\t')
            .with_has_header(false);
        let mut adapter = FileAdapter::new(vec![first, second], options);
        adapter.open().await.unwrap();

        let batches = drain(&mut adapter, 2).await;
        let ids: Vec<Value> = batches
            .iter()
            .flat_map(|b| b.rows().iter().map(|r| r[0].clone()))
            .collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(
            ids,
            vec![Value::text("1"), Value::text("2"), Value::text("3"), Value::text("4")]
        );
        assert_eq!(adapter.schema_hints(), SchemaHints::default());
    }

    #[tokio::test]
    async fn test_mismatched_header_is_adapter_error() {
        let dir = tempfile::tempdir().unwrap();
        let first = write(dir.path(), "1.csv", "id,name\n1,a\n");
        let second = write(dir.path(), "2.csv", "id,email\n2,b\n");

        let mut adapter = FileAdapter::new(vec![first, second], DelimitedOptions::default());
        adapter.open().await.unwrap();
        let err = adapter.next_batch(10).await.unwrap_err();
        assert!(matches!(err, ExportError::Adapter { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = FileAdapter::new(
            vec![dir.path().join("absent.csv")],
            DelimitedOptions::default(),
        );
        assert!(adapter.open().await.is_err());
    }

    #[tokio::test]
    async fn test_header_only_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "empty.csv", "id,name\n");
        let mut adapter = FileAdapter::new(vec![path], DelimitedOptions::default());
        adapter.open().await.unwrap();
        assert!(adapter.next_batch(5).await.unwrap().is_none());
    }

    #[test]
    fn test_matches_extension() {
        let options = DelimitedOptions::default();
        assert!(options.matches_extension(Path::new("data/Orders.CSV")));
        assert!(!options.matches_extension(Path::new("data/orders.parquet")));
        assert!(!options.matches_extension(Path::new("data/README")));
    }
}
