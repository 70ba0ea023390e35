//! Export unit: one table from open to terminal outcome
//!
//! ```text
//! Opening -> SchemaPending -> Streaming -> Closing -> Succeeded | Failed
//! ```
//!
//! The state machine is the same for every source kind. A failed `open`
//! ends the unit immediately without a `close`; once the source is open,
//! `Closing` always runs, whatever happened while streaming. Parts written
//! before a failure stay on disk and are counted in the outcome.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::ColumnarCodec;
use crate::config::ExportConfig;
use crate::error::{ExportError, Result};
use crate::model::{ExportOutcome, RowBatch, TableDescriptor};
use crate::progress::ProgressSink;
use crate::schema::{ColumnSchema, SchemaResolver};
use crate::source::SourceAdapter;
use crate::writer::PartWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Opening,
    SchemaPending,
    Streaming,
    Closing,
    Succeeded,
    Failed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Succeeded | UnitState::Failed)
    }
}

pub struct ExportUnit {
    descriptor: TableDescriptor,
    adapter: Box<dyn SourceAdapter>,
    writer: PartWriter,
    chunk_size: usize,
    overwrite: bool,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    state: UnitState,
    rows: u64,
}

impl ExportUnit {
    pub fn new(
        descriptor: TableDescriptor,
        adapter: Box<dyn SourceAdapter>,
        codec: Arc<dyn ColumnarCodec>,
        config: &ExportConfig,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        let writer = PartWriter::new(
            descriptor.output_dir.clone(),
            codec,
            config.compression,
            config.retry,
        );

        Self {
            descriptor,
            adapter,
            writer,
            chunk_size: config.chunk_size.max(1),
            overwrite: config.overwrite,
            progress,
            cancel,
            state: UnitState::Opening,
            rows: 0,
        }
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Drive the unit to a terminal state
    #[instrument(
        name = "export_unit",
        skip_all,
        fields(table = %self.descriptor.name, source = self.descriptor.source.kind_str())
    )]
    pub async fn run(mut self) -> ExportOutcome {
        let outcome = self.drive().await;
        self.progress.unit_finished(&outcome);
        outcome
    }

    async fn drive(&mut self) -> ExportOutcome {
        if self.cancel.is_cancelled() {
            return self.fail(ExportError::Cancelled);
        }

        if let Err(err) = self.adapter.open().await {
            return self.fail(err);
        }
        self.progress
            .unit_started(&self.descriptor.name, self.adapter.estimated_rows());

        let streamed = self.stream().await;

        self.transition(UnitState::Closing);
        let closed = self.adapter.close().await;

        match (streamed, closed) {
            (Ok(()), Ok(())) => self.succeed(),
            (Ok(()), Err(close_err)) => self.fail(close_err),
            (Err(err), close_result) => {
                if let Err(close_err) = close_result {
                    warn!(error = %close_err, "Source close failed after stream error");
                }
                self.fail(err)
            },
        }
    }

    async fn stream(&mut self) -> Result<()> {
        self.writer.prepare(self.overwrite).await?;

        self.transition(UnitState::SchemaPending);
        let Some(first) = self.pull().await? else {
            info!("Source is empty, no parts written");
            return Ok(());
        };

        let hints = self.adapter.schema_hints();
        let schema = Arc::new(SchemaResolver::resolve(&first, &hints)?);
        info!(
            columns = schema.len(),
            schema = %describe(&schema),
            "Schema resolved"
        );
        self.write(&schema, first).await?;

        self.transition(UnitState::Streaming);
        loop {
            if self.cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            match self.pull().await? {
                Some(batch) => self.write(&schema, batch).await?,
                None => return Ok(()),
            }
        }
    }

    /// Next batch from the source; an empty batch counts as end of data
    async fn pull(&mut self) -> Result<Option<RowBatch>> {
        match self.adapter.next_batch(self.chunk_size).await? {
            Some(batch) if batch.len() > self.chunk_size => Err(ExportError::adapter(format!(
                "source returned {} rows for a batch of at most {}",
                batch.len(),
                self.chunk_size
            ))),
            Some(batch) if batch.is_empty() => Ok(None),
            other => Ok(other),
        }
    }

    async fn write(&mut self, schema: &Arc<ColumnSchema>, batch: RowBatch) -> Result<()> {
        let conformed = schema.conform(batch, self.rows)?;
        let part = self.writer.write(schema, conformed).await?;

        self.rows += part.rows;
        debug!(part = part.sequence, rows = part.rows, bytes = part.bytes, "Part written");
        self.progress.part_written(&self.descriptor.name, &part);
        Ok(())
    }

    fn transition(&mut self, next: UnitState) {
        debug!(from = ?self.state, to = ?next, "Unit state change");
        self.state = next;
    }

    fn succeed(&mut self) -> ExportOutcome {
        self.transition(UnitState::Succeeded);
        let parts = self.writer.parts_written();
        info!(rows = self.rows, parts, "Table exported");

        ExportOutcome::Succeeded {
            table: self.descriptor.name.clone(),
            rows: self.rows,
            parts,
        }
    }

    fn fail(&mut self, err: ExportError) -> ExportOutcome {
        self.transition(UnitState::Failed);
        let parts = self.writer.parts_written();
        error!(
            kind = %err.kind(),
            error = %err,
            rows = self.rows,
            parts,
            "Table export failed"
        );

        ExportOutcome::failed(&self.descriptor.name, &err, self.rows, parts)
    }
}

fn describe(schema: &ColumnSchema) -> String {
    schema
        .columns()
        .iter()
        .map(|c| format!("{}:{}", c.name, c.data_type))
        .collect::<Vec<_>>()
        .join(", ")
}
