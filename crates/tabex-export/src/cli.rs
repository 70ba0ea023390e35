//! Command-line surface of the `tabex` binary
//!
//! - `tabex export`: export selected tables to part-file directories
//! - `tabex list`: print the tables a source would export
//!
//! Exit codes: 0 when every table succeeded, 1 when at least one table
//! failed, 2 when the run could not start (bad configuration, unreachable
//! source).

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::Compression;
use crate::config::{
    DatabaseSettings, ExportConfig, RetryPolicy, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENCY,
};
use crate::db::{Database, SqlxDatabase};
use crate::model::TableDescriptor;
use crate::orchestrator::Orchestrator;
use crate::plan::{self, SourceKind};
use crate::progress::{BarProgress, NoProgress, ProgressSink};
use crate::selector::TableSelector;
use crate::source::{DelimitedOptions, DumpDocument, SourceContext};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_TABLE_FAILED: i32 = 1;
pub const EXIT_SETUP_FAILED: i32 = 2;

/// Tabex - export tables to chunked columnar part files
#[derive(Parser, Debug)]
#[command(name = "tabex")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Export tables as directories of part files
    Export(ExportArgs),

    /// List the tables a source would export
    List(SourceArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Kind of source to read
    #[arg(long, value_enum, env = "TABEX_SOURCE_KIND")]
    pub source_kind: SourceKind,

    /// Database URL, dump file, or delimited file/directory
    /// (database URL falls back to DATABASE_URL)
    #[arg(long, env = "TABEX_SOURCE")]
    pub source: Option<String>,

    /// Tables to include; `*` and `?` act as wildcards
    #[arg(long, value_delimiter = ',', env = "TABEX_TABLES")]
    pub tables: Vec<String>,

    /// Tables to skip; `*` and `?` act as wildcards
    #[arg(long, value_delimiter = ',', env = "TABEX_EXCLUDE")]
    pub exclude: Vec<String>,

    /// Field delimiter for delimited files (`tab` or `\t` for tabs)
    #[arg(long, default_value = ",", value_parser = parse_delimiter)]
    pub delimiter: u8,

    /// Delimited files have no header row
    #[arg(long)]
    pub no_header: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Output root; each table becomes a subdirectory
    #[arg(short, long, env = "TABEX_OUTPUT")]
    pub output: PathBuf,

    /// Part file compression
    #[arg(long, value_enum, default_value_t = Compression::Fast, env = "TABEX_COMPRESSION")]
    pub compression: Compression,

    /// Maximum rows per batch and per part file
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "TABEX_CHUNK_SIZE")]
    pub chunk_size: usize,

    /// Tables exported at the same time
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY, env = "TABEX_MAX_CONCURRENCY")]
    pub max_concurrency: usize,

    /// Keyset order column for a database table, as `table=column` (repeatable)
    #[arg(long = "order-by", value_name = "TABLE=COLUMN")]
    pub order_by: Vec<String>,

    /// Fail tables whose directory already holds part files instead of
    /// replacing them
    #[arg(long)]
    pub no_overwrite: bool,

    /// Extra attempts for a part write that hits an I/O error
    #[arg(long, default_value_t = 0, env = "TABEX_RETRIES")]
    pub retries: u32,

    /// Base delay between part write attempts, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,

    /// Write the run report as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,
}

fn parse_delimiter(raw: &str) -> std::result::Result<u8, String> {
    match raw {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        _ => match raw.as_bytes() {
            [byte] if byte.is_ascii() => Ok(*byte),
            _ => Err(format!("delimiter must be a single ASCII character, got '{}'", raw)),
        },
    }
}

impl SourceArgs {
    fn selector(&self) -> Result<TableSelector> {
        Ok(TableSelector::new(&self.tables, &self.exclude)?)
    }

    fn file_options(&self) -> DelimitedOptions {
        DelimitedOptions::new()
            .with_delimiter(self.delimiter)
            .with_has_header(!self.no_header)
    }

    fn location(&self) -> Result<String> {
        if let Some(source) = &self.source {
            return Ok(source.clone());
        }
        if self.source_kind == SourceKind::Db {
            if let Ok(url) = std::env::var("DATABASE_URL") {
                return Ok(url);
            }
        }
        bail!("--source is required for {:?} sources", self.source_kind)
    }
}

/// Shared source resources plus the planned tables
struct PreparedSource {
    context: SourceContext,
    descriptors: Vec<TableDescriptor>,
}

async fn prepare_source(
    args: &SourceArgs,
    output_root: &Path,
    order_by: &[String],
    max_concurrency: usize,
) -> Result<PreparedSource> {
    let location = args.location()?;
    let selector = args.selector()?;
    let file_options = args.file_options();
    let context = SourceContext::default().with_file_options(file_options.clone());

    match args.source_kind {
        SourceKind::Db => {
            let order_keys = plan::parse_order_keys(order_by)?;
            let database: Arc<dyn Database> = Arc::new(
                SqlxDatabase::connect(&DatabaseSettings::new(location), max_concurrency)
                    .await
                    .context("Failed to connect to source database")?,
            );
            let descriptors =
                plan::plan_database(database.as_ref(), &selector, &order_keys, output_root)
                    .await
                    .context("Failed to list database tables")?;
            Ok(PreparedSource {
                context: context.with_database(database),
                descriptors,
            })
        },
        SourceKind::Dump => {
            if !order_by.is_empty() {
                warn!("--order-by only applies to database sources");
            }
            let document = Arc::new(
                DumpDocument::load(&location)
                    .await
                    .with_context(|| format!("Failed to read SQL dump {}", location))?,
            );
            let descriptors = plan::plan_dump(&document, &selector, output_root)?;
            Ok(PreparedSource {
                context: context.with_dump(document),
                descriptors,
            })
        },
        SourceKind::Files => {
            if !order_by.is_empty() {
                warn!("--order-by only applies to database sources");
            }
            let descriptors = plan::plan_files(
                Path::new(&location),
                &file_options,
                &selector,
                output_root,
            )
            .await
            .with_context(|| format!("Failed to scan {}", location))?;
            Ok(PreparedSource {
                context,
                descriptors,
            })
        },
    }
}

/// Run the parsed command; the returned value is the process exit code
pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<i32> {
    match cli.command {
        Commands::Export(args) => run_export(args, cancel).await,
        Commands::List(args) => run_list(args).await,
    }
}

async fn run_export(args: ExportArgs, cancel: CancellationToken) -> Result<i32> {
    let config = ExportConfig::new()
        .with_chunk_size(args.chunk_size)
        .with_max_concurrency(args.max_concurrency)
        .with_compression(args.compression)
        .with_overwrite(!args.no_overwrite)
        .with_retry(RetryPolicy::new(
            args.retries.saturating_add(1),
            Duration::from_millis(args.retry_backoff_ms),
        ));
    config.validate()?;

    let prepared = prepare_source(
        &args.source,
        &args.output,
        &args.order_by,
        config.max_concurrency,
    )
    .await?;

    if prepared.descriptors.is_empty() {
        warn!("No tables selected, nothing to export");
    }

    let progress: Arc<dyn ProgressSink> = if args.no_progress {
        Arc::new(NoProgress)
    } else {
        Arc::new(BarProgress::new())
    };

    let orchestrator = Orchestrator::new(config, Arc::new(prepared.context))
        .with_progress(progress)
        .with_cancellation(cancel);
    let report = orchestrator.export(prepared.descriptors).await?;

    println!("{}", report.render_table());

    if let Some(path) = &args.report {
        report
            .write_json(path)
            .await
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(if report.all_succeeded() {
        EXIT_SUCCESS
    } else {
        EXIT_TABLE_FAILED
    })
}

async fn run_list(args: SourceArgs) -> Result<i32> {
    let prepared = prepare_source(&args, Path::new("."), &[], 1).await?;
    for descriptor in &prepared.descriptors {
        println!("{}", descriptor.name);
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_export_command() {
        let cli = Cli::try_parse_from([
            "tabex",
            "export",
            "--source-kind",
            "dump",
            "--source",
            "db.sql",
            "--output",
            "out",
            "--tables",
            "a,b",
            "--compression",
            "high-ratio",
            "--chunk-size",
            "10",
            "--order-by",
            "a=id",
        ])
        .unwrap();

        let Commands::Export(args) = cli.command else {
            panic!("expected export");
        };
        assert_eq!(args.source.source_kind, SourceKind::Dump);
        assert_eq!(args.source.tables, vec!["a", "b"]);
        assert_eq!(args.compression, Compression::HighRatio);
        assert_eq!(args.chunk_size, 10);
        assert_eq!(args.order_by, vec!["a=id"]);
        assert!(!args.no_overwrite);
    }

    #[test]
    fn test_parse_delimiter() {
        assert_eq!(parse_delimiter(";").unwrap(), b';');
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter("\\t").unwrap(), b'\t');
        assert!(parse_delimiter("ab").is_err());
    }

    #[test]
    fn test_list_requires_source_kind() {
        assert!(Cli::try_parse_from(["tabex", "list"]).is_err());
    }
}
