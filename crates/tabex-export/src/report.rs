//! Aggregate report for an export run

use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{ExportError, Result};
use crate::model::ExportOutcome;

/// Every table's outcome plus run totals
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub outcomes: Vec<ExportOutcome>,
    pub elapsed_seconds: f64,
}

impl ExportReport {
    pub fn new(outcomes: Vec<ExportOutcome>, elapsed: Duration) -> Self {
        Self {
            outcomes,
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    /// True for an empty run as well
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(ExportOutcome::is_success)
    }

    pub fn any_succeeded(&self) -> bool {
        self.outcomes.iter().any(ExportOutcome::is_success)
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.succeeded_count()
    }

    pub fn total_rows(&self) -> u64 {
        self.outcomes.iter().map(ExportOutcome::rows).sum()
    }

    pub fn total_parts(&self) -> u64 {
        self.outcomes.iter().map(ExportOutcome::parts).sum()
    }

    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Table", "Status", "Rows", "Parts", "Error"]);

        for outcome in &self.outcomes {
            let (status, error) = match outcome {
                ExportOutcome::Succeeded { .. } => ("succeeded".to_string(), "-".to_string()),
                ExportOutcome::Failed { kind, error, .. } => {
                    (format!("failed ({})", kind), truncate(error, 60))
                },
            };
            table.add_row(vec![
                outcome.table().to_string(),
                status,
                outcome.rows().to_string(),
                outcome.parts().to_string(),
                error,
            ]);
        }

        format!(
            "{}\n{} succeeded, {} failed, {} rows in {} parts ({:.2}s)",
            table,
            self.succeeded_count(),
            self.failed_count(),
            self.total_rows(),
            self.total_parts(),
            self.elapsed_seconds
        )
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExportError::Config(format!("cannot serialize report: {}", e)))
    }

    pub async fn write_json(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| ExportError::io(path, e))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
