//! Export orchestrator
//!
//! Runs export units on a bounded pool: at most `max_concurrency` units are
//! in flight, each owning one table end to end. A unit's failure never
//! reaches its siblings; the orchestrator waits for every unit and returns
//! one outcome per descriptor, in descriptor order.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::codec::{ColumnarCodec, ParquetCodec};
use crate::config::ExportConfig;
use crate::error::{ExportError, Result};
use crate::model::{ExportOutcome, TableDescriptor};
use crate::progress::{NoProgress, ProgressSink};
use crate::report::ExportReport;
use crate::source::AdapterFactory;
use crate::unit::ExportUnit;

pub struct Orchestrator {
    config: ExportConfig,
    factory: Arc<dyn AdapterFactory>,
    codec: Arc<dyn ColumnarCodec>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: ExportConfig, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            config,
            factory,
            codec: Arc::new(ParquetCodec),
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn ColumnarCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops every unit at its next batch boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Run one unit per descriptor, at most `max_concurrency` at a time
    pub async fn run(
        &self,
        descriptors: Vec<TableDescriptor>,
        max_concurrency: usize,
    ) -> Vec<ExportOutcome> {
        let concurrency = max_concurrency.max(1);
        let total = descriptors.len();
        info!(tables = total, concurrency, "Starting export run");

        let mut outcomes: Vec<(usize, ExportOutcome)> =
            stream::iter(descriptors.into_iter().enumerate())
                .map(|(index, descriptor)| async move {
                    info!(table = %descriptor.name, "Starting table {} / {}", index + 1, total);
                    (index, self.export_table(descriptor).await)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Validate the configuration, run every descriptor and time the run
    pub async fn export(&self, descriptors: Vec<TableDescriptor>) -> Result<ExportReport> {
        self.config.validate()?;
        check_distinct_outputs(&descriptors)?;

        let started = Instant::now();
        let outcomes = self.run(descriptors, self.config.max_concurrency).await;
        let report = ExportReport::new(outcomes, started.elapsed());

        info!(
            succeeded = report.succeeded_count(),
            failed = report.failed_count(),
            rows = report.total_rows(),
            elapsed_secs = report.elapsed_seconds,
            "Export run finished"
        );
        Ok(report)
    }

    async fn export_table(&self, descriptor: TableDescriptor) -> ExportOutcome {
        let name = descriptor.name.clone();

        let adapter = match self.factory.create(&descriptor) {
            Ok(adapter) => adapter,
            Err(err) => {
                error!(table = %name, error = %err, "Cannot build source adapter");
                let outcome = ExportOutcome::failed(&name, &err, 0, 0);
                self.progress.unit_finished(&outcome);
                return outcome;
            },
        };

        let unit = ExportUnit::new(
            descriptor,
            adapter,
            self.codec.clone(),
            &self.config,
            self.progress.clone(),
            self.cancel.clone(),
        );

        // Each unit gets its own task; a panic stays inside that table.
        match tokio::spawn(unit.run()).await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let err = ExportError::adapter(format!("export task aborted: {}", join_err));
                error!(table = %name, error = %err, "Export task did not complete");
                let outcome = ExportOutcome::failed(&name, &err, 0, 0);
                self.progress.unit_finished(&outcome);
                outcome
            },
        }
    }
}

/// Two tables sharing a directory would overwrite each other's parts
fn check_distinct_outputs(descriptors: &[TableDescriptor]) -> Result<()> {
    let mut owners: HashMap<&Path, &str> = HashMap::new();
    for descriptor in descriptors {
        if let Some(other) = owners.insert(&descriptor.output_dir, &descriptor.name) {
            return Err(ExportError::Config(format!(
                "tables '{}' and '{}' both write to {}",
                other,
                descriptor.name,
                descriptor.output_dir.display()
            )));
        }
    }
    Ok(())
}
