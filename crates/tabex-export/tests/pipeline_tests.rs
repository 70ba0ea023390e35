//! End-to-end tests of the export pipeline through the library API
//!
//! Each test builds real sources (SQL dump text, delimited files, a SQLite
//! database file) in a temporary directory, runs the orchestrator and reads
//! the written Parquet parts back.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use arrow::array::{Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabex_export::error::ErrorKind;
use tabex_export::progress::ProgressSink;
use tabex_export::{
    plan, AdapterFactory, DelimitedOptions, DumpDocument, ExportConfig, ExportError,
    ExportOutcome, Orchestrator, PartFile, RowBatch, SourceAdapter, SourceContext, SourceRef,
    SqlxDatabase, TableDescriptor, TableSelector, Value,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

fn part_paths(table_dir: &Path) -> Vec<PathBuf> {
    let mut parts: Vec<PathBuf> = std::fs::read_dir(table_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    parts.sort();
    parts
}

fn read_part(path: &Path) -> Vec<RecordBatch> {
    let file = std::fs::File::open(path).unwrap();
    ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap()
        .map(|batch| batch.unwrap())
        .collect()
}

fn part_row_counts(table_dir: &Path) -> Vec<usize> {
    part_paths(table_dir)
        .iter()
        .map(|p| read_part(p).iter().map(RecordBatch::num_rows).sum())
        .collect()
}

fn int_column(path: &Path, index: usize) -> Vec<i64> {
    read_part(path)
        .iter()
        .flat_map(|batch| {
            let column = batch
                .column(index)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            (0..column.len()).map(|i| column.value(i)).collect::<Vec<_>>()
        })
        .collect()
}

fn dump_with_rows(table: &str, rows: usize) -> String {
    let values: Vec<String> = (1..=rows).map(|i| format!("({}, 'name {}')", i, i)).collect();
    format!(
        "CREATE TABLE `{table}` (\n  `id` INT NOT NULL,\n  `name` VARCHAR(32)\n);\n\
         INSERT INTO `{table}` VALUES {};\n",
        values.join(",")
    )
}

fn dump_descriptor(table: &str, root: &Path) -> TableDescriptor {
    TableDescriptor::new(
        table,
        SourceRef::Dump {
            table: table.to_string(),
        },
        root,
    )
}

async fn export_dump(
    text: String,
    tables: &[&str],
    config: ExportConfig,
) -> (TempDir, Vec<ExportOutcome>) {
    let out = TempDir::new().unwrap();
    let context = SourceContext::default().with_dump(Arc::new(DumpDocument::from_text(text)));
    let descriptors = tables.iter().map(|t| dump_descriptor(t, out.path())).collect();

    let report = Orchestrator::new(config, Arc::new(context))
        .export(descriptors)
        .await
        .unwrap();
    (out, report.outcomes)
}

// ============================================================================
// Chunking and Ordering
// ============================================================================

#[tokio::test]
async fn test_ten_rows_in_chunks_of_three() {
    let (out, outcomes) = export_dump(
        dump_with_rows("users", 10),
        &["users"],
        ExportConfig::default().with_chunk_size(3),
    )
    .await;

    assert!(outcomes[0].is_success());
    assert_eq!(outcomes[0].rows(), 10);
    assert_eq!(outcomes[0].parts(), 4);

    let table_dir = out.path().join("users");
    let parts = part_paths(&table_dir);
    let names: Vec<String> = parts
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "part-00000.parquet",
            "part-00001.parquet",
            "part-00002.parquet",
            "part-00003.parquet"
        ]
    );
    assert_eq!(part_row_counts(&table_dir), vec![3, 3, 3, 1]);

    // Source order survives across parts
    let ids: Vec<i64> = parts.iter().flat_map(|p| int_column(p, 0)).collect();
    assert_eq!(ids, (1..=10).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_batches_never_exceed_capacity() {
    let input = TempDir::new().unwrap();
    let mut csv = String::from("id,label\n");
    for i in 0..250 {
        csv.push_str(&format!("{},row-{}\n", i, i));
    }
    let file = input.path().join("events.csv");
    std::fs::write(&file, csv).unwrap();

    for capacity in [1usize, 100, 100_000] {
        let out = TempDir::new().unwrap();
        let descriptor = TableDescriptor::new(
            "events",
            SourceRef::Files {
                paths: vec![file.clone()],
            },
            out.path(),
        );
        let report = Orchestrator::new(
            ExportConfig::default().with_chunk_size(capacity),
            Arc::new(SourceContext::default()),
        )
        .export(vec![descriptor])
        .await
        .unwrap();

        assert!(report.all_succeeded(), "capacity {}", capacity);
        assert_eq!(report.total_rows(), 250);

        let counts = part_row_counts(&out.path().join("events"));
        assert_eq!(counts.len(), 250usize.div_ceil(capacity));
        assert!(counts.iter().all(|&n| n <= capacity && n > 0));
        assert_eq!(counts.iter().sum::<usize>(), 250);
    }
}

#[tokio::test]
async fn test_empty_table_succeeds_without_parts() {
    let text = "CREATE TABLE `audit` (`id` INT);\n".to_string();
    let (out, outcomes) = export_dump(text, &["audit"], ExportConfig::default()).await;

    assert!(outcomes[0].is_success());
    assert_eq!((outcomes[0].rows(), outcomes[0].parts()), (0, 0));
    let table_dir = out.path().join("audit");
    assert!(!table_dir.exists() || part_paths(&table_dir).is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_schema_conflict_keeps_earlier_parts() {
    let input = TempDir::new().unwrap();
    let scores = input.path().join("scores.csv");
    std::fs::write(&scores, "id\n1\n2\n3\nnot-a-number\n5\n").unwrap();
    let cities = input.path().join("cities.csv");
    std::fs::write(&cities, "id,name\n1,Oslo\n2,Lima\n3,Pune\n").unwrap();

    let out = TempDir::new().unwrap();
    let descriptors = vec![
        TableDescriptor::new("scores", SourceRef::Files { paths: vec![scores] }, out.path()),
        TableDescriptor::new("cities", SourceRef::Files { paths: vec![cities] }, out.path()),
    ];
    let report = Orchestrator::new(
        ExportConfig::default().with_chunk_size(2),
        Arc::new(SourceContext::default()),
    )
    .export(descriptors)
    .await
    .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.error_kind(), Some(ErrorKind::SchemaConflict));
    assert_eq!(outcome.parts(), 1);
    assert_eq!(outcome.rows(), 2);

    // The sibling table is unaffected
    let sibling = &report.outcomes[1];
    assert_eq!(sibling.table(), "cities");
    assert!(sibling.is_success());
    assert_eq!((sibling.rows(), sibling.parts()), (3, 2));
    assert_eq!(part_row_counts(&out.path().join("cities")), vec![2, 1]);

    let table_dir = out.path().join("scores");
    assert_eq!(part_row_counts(&table_dir), vec![2]);
    let leftovers: Vec<_> = std::fs::read_dir(&table_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|n| n.to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

/// Tracks how many adapters are open at the same time
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct GaugedAdapter {
    gauge: Arc<Gauge>,
    fail: bool,
    done: bool,
}

#[async_trait]
impl SourceAdapter for GaugedAdapter {
    async fn open(&mut self) -> tabex_export::Result<()> {
        let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    async fn next_batch(&mut self, _capacity: usize) -> tabex_export::Result<Option<RowBatch>> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail {
            return Err(ExportError::adapter("socket closed"));
        }
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(RowBatch::new(vec![vec![Value::Int(1)], vec![Value::Int(2)]])))
    }

    async fn close(&mut self) -> tabex_export::Result<()> {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct GaugedFactory {
    gauge: Arc<Gauge>,
    failing: &'static str,
}

impl AdapterFactory for GaugedFactory {
    fn create(&self, descriptor: &TableDescriptor) -> tabex_export::Result<Box<dyn SourceAdapter>> {
        Ok(Box::new(GaugedAdapter {
            gauge: self.gauge.clone(),
            fail: descriptor.name == self.failing,
            done: false,
        }))
    }
}

#[tokio::test]
async fn test_failure_is_isolated_and_concurrency_bounded() {
    let out = TempDir::new().unwrap();
    let gauge = Arc::new(Gauge {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let factory = GaugedFactory {
        gauge: gauge.clone(),
        failing: "t3",
    };
    let descriptors = ["t1", "t2", "t3", "t4", "t5"]
        .iter()
        .map(|t| dump_descriptor(t, out.path()))
        .collect();

    let report = Orchestrator::new(
        ExportConfig::default().with_max_concurrency(2),
        Arc::new(factory),
    )
    .export(descriptors)
    .await
    .unwrap();

    assert_eq!(report.outcomes.len(), 5);
    for (index, outcome) in report.outcomes.iter().enumerate() {
        assert_eq!(outcome.table(), format!("t{}", index + 1));
        if index == 2 {
            assert_eq!(outcome.error_kind(), Some(ErrorKind::Adapter));
        } else {
            assert!(outcome.is_success());
            assert_eq!((outcome.rows(), outcome.parts()), (2, 1));
        }
    }
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(gauge.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_existing_parts_without_overwrite_fail_the_table() {
    let out = TempDir::new().unwrap();
    let table_dir = out.path().join("users");
    std::fs::create_dir_all(&table_dir).unwrap();
    std::fs::write(table_dir.join("part-00000.parquet"), b"old").unwrap();

    let context = SourceContext::default()
        .with_dump(Arc::new(DumpDocument::from_text(dump_with_rows("users", 2))));
    let report = Orchestrator::new(
        ExportConfig::default().with_overwrite(false),
        Arc::new(context),
    )
    .export(vec![dump_descriptor("users", out.path())])
    .await
    .unwrap();

    assert_eq!(report.outcomes[0].error_kind(), Some(ErrorKind::Io));
    assert_eq!(std::fs::read(table_dir.join("part-00000.parquet")).unwrap(), b"old");
}

// ============================================================================
// Sources
// ============================================================================

#[tokio::test]
async fn test_dump_values_with_commas_and_escapes() {
    let text = "INSERT INTO notes (id, body) VALUES (1,'a, b'),(2,'it\\'s (fine)'),(3,NULL);\n"
        .to_string();
    let (out, outcomes) = export_dump(text, &["notes"], ExportConfig::default()).await;

    assert!(outcomes[0].is_success());
    assert_eq!(outcomes[0].rows(), 3);

    let parts = part_paths(&out.path().join("notes"));
    let batches = read_part(&parts[0]);
    let schema = batches[0].schema();
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["id", "body"]);

    let body = batches[0]
        .column(1)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    assert_eq!(body.value(0), "a, b");
    assert_eq!(body.value(1), "it's (fine)");
    assert!(body.is_null(2));
}

#[tokio::test]
async fn test_dump_with_keyword_named_columns() {
    let text = "CREATE TABLE public.kv (\n\
                key text NOT NULL,\n\
                value text,\n\
                CONSTRAINT kv_pkey PRIMARY KEY (key)\n\
                );\n\
                INSERT INTO public.kv VALUES ('a','b'),('c','d');\n"
        .to_string();
    let (out, outcomes) = export_dump(text, &["public.kv"], ExportConfig::default()).await;

    assert!(outcomes[0].is_success(), "{:?}", outcomes[0]);
    assert_eq!(outcomes[0].rows(), 2);

    let parts = part_paths(&out.path().join("public.kv"));
    let schema = read_part(&parts[0])[0].schema();
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["key", "value"]);
}

#[tokio::test]
async fn test_dump_definition_wider_than_rows_is_inferred() {
    let text = "CREATE TABLE `pairs` (`a` INT, `b` INT, `c` INT);\n\
                INSERT INTO `pairs` VALUES (1,2),(3,4);\n"
        .to_string();
    let (out, outcomes) = export_dump(text, &["pairs"], ExportConfig::default()).await;

    assert!(outcomes[0].is_success(), "{:?}", outcomes[0]);
    let parts = part_paths(&out.path().join("pairs"));
    assert_eq!(int_column(&parts[0], 1), vec![2, 4]);
}

#[tokio::test]
async fn test_directory_of_files_planned_and_exported() {
    let input = TempDir::new().unwrap();
    std::fs::write(input.path().join("cities.csv"), "id,name\n1,Oslo\n2,Lima\n").unwrap();
    std::fs::create_dir(input.path().join("trips")).unwrap();
    std::fs::write(input.path().join("trips").join("a.csv"), "id\n1\n2\n").unwrap();
    std::fs::write(input.path().join("trips").join("b.csv"), "id\n3\n").unwrap();

    let out = TempDir::new().unwrap();
    let options = DelimitedOptions::default();
    let descriptors = plan::plan_files(input.path(), &options, &TableSelector::all(), out.path())
        .await
        .unwrap();

    let report = Orchestrator::new(
        ExportConfig::default(),
        Arc::new(SourceContext::default().with_file_options(options)),
    )
    .export(descriptors)
    .await
    .unwrap();

    assert!(report.all_succeeded());
    let rows: HashMap<&str, u64> = report.outcomes.iter().map(|o| (o.table(), o.rows())).collect();
    assert_eq!(rows["cities"], 2);
    assert_eq!(rows["trips"], 3);

    let ids = int_column(&part_paths(&out.path().join("trips"))[0], 0);
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_sqlite_database_with_keyset_and_offset_paging() {
    let db_dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", db_dir.path().join("source.db").display());
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .unwrap();

    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL, note TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE customers (name TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    for i in 1..=7 {
        sqlx::query("INSERT INTO orders (id, total, note) VALUES (?, ?, ?)")
            .bind(i)
            .bind(i as f64 * 1.5)
            .bind(if i % 2 == 0 { None } else { Some(format!("order {}", i)) })
            .execute(&pool)
            .await
            .unwrap();
    }
    for name in ["ada", "grace", "linus"] {
        sqlx::query("INSERT INTO customers (name) VALUES (?)")
            .bind(name)
            .execute(&pool)
            .await
            .unwrap();
    }

    let database = Arc::new(SqlxDatabase::from_sqlite_pool(pool));
    let order_keys = plan::parse_order_keys(&["orders=id"]).unwrap();
    let out = TempDir::new().unwrap();
    let descriptors =
        plan::plan_database(database.as_ref(), &TableSelector::all(), &order_keys, out.path())
            .await
            .unwrap();
    assert_eq!(descriptors.len(), 2);

    let report = Orchestrator::new(
        ExportConfig::default().with_chunk_size(3),
        Arc::new(SourceContext::default().with_database(database)),
    )
    .export(descriptors)
    .await
    .unwrap();

    assert!(report.all_succeeded());
    let orders_dir = out.path().join("orders");
    assert_eq!(part_row_counts(&orders_dir), vec![3, 3, 1]);
    let ids: Vec<i64> = part_paths(&orders_dir)
        .iter()
        .flat_map(|p| int_column(p, 0))
        .collect();
    assert_eq!(ids, (1..=7).collect::<Vec<i64>>());
    assert_eq!(part_row_counts(&out.path().join("customers")), vec![3]);
}

#[tokio::test]
async fn test_cancelled_run_reports_every_table() {
    let out = TempDir::new().unwrap();
    let context = SourceContext::default()
        .with_dump(Arc::new(DumpDocument::from_text(dump_with_rows("users", 5))));
    let orchestrator = Orchestrator::new(ExportConfig::default(), Arc::new(context));
    orchestrator.cancellation_token().cancel();

    let report = orchestrator
        .export(vec![dump_descriptor("users", out.path())])
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].error_kind(), Some(ErrorKind::Cancelled));
}

/// Cancels the run as soon as the first part lands
struct CancelAfterFirstPart {
    cancel: CancellationToken,
}

impl ProgressSink for CancelAfterFirstPart {
    fn part_written(&self, _table: &str, _part: &PartFile) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test_cancel_mid_stream_keeps_written_parts() {
    let out = TempDir::new().unwrap();
    let context = SourceContext::default()
        .with_dump(Arc::new(DumpDocument::from_text(dump_with_rows("users", 10))));
    let cancel = CancellationToken::new();
    let config = ExportConfig::default().with_chunk_size(3);
    let orchestrator = Orchestrator::new(config, Arc::new(context))
        .with_cancellation(cancel.clone())
        .with_progress(Arc::new(CancelAfterFirstPart { cancel }));

    let report = orchestrator
        .export(vec![dump_descriptor("users", out.path())])
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!((outcome.rows(), outcome.parts()), (3, 1));

    let table_dir = out.path().join("users");
    assert_eq!(part_row_counts(&table_dir), vec![3]);
    assert_eq!(int_column(&part_paths(&table_dir)[0], 0), vec![1, 2, 3]);
}
