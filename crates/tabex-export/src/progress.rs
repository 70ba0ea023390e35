//! Progress reporting for export units
//!
//! Units report into a [`ProgressSink`]; the library default is
//! [`NoProgress`] and the binary uses [`BarProgress`], one `indicatif` bar
//! per active table.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::{ExportOutcome, PartFile};

pub trait ProgressSink: Send + Sync {
    /// A unit opened its source; `estimated_rows` is known for database tables
    fn unit_started(&self, _table: &str, _estimated_rows: Option<u64>) {}

    fn part_written(&self, _table: &str, _part: &PartFile) {}

    fn unit_finished(&self, _outcome: &ExportOutcome) {}
}

/// Discards all progress events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Terminal progress bars, one per running table
pub struct BarProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl BarProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn counted_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} {prefix:<24} [{wide_bar:.cyan/blue}] {pos}/{len} rows {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }

    fn open_ended_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {prefix:<24} {pos} rows {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }
}

impl ProgressSink for BarProgress {
    fn unit_started(&self, table: &str, estimated_rows: Option<u64>) {
        let bar = match estimated_rows {
            Some(total) => self
                .multi
                .add(ProgressBar::new(total).with_style(Self::counted_style())),
            None => {
                let bar = self
                    .multi
                    .add(ProgressBar::new_spinner().with_style(Self::open_ended_style()));
                bar.enable_steady_tick(std::time::Duration::from_millis(120));
                bar
            },
        };
        bar.set_prefix(table.to_string());

        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(table.to_string(), bar);
        }
    }

    fn part_written(&self, table: &str, part: &PartFile) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(bar) = bars.get(table) {
                bar.inc(part.rows);
                bar.set_message(format!(
                    "{} parts, last {}",
                    part.sequence + 1,
                    format_bytes(part.bytes)
                ));
            }
        }
    }

    fn unit_finished(&self, outcome: &ExportOutcome) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        if let Some(bar) = bars.remove(outcome.table()) {
            match outcome {
                ExportOutcome::Succeeded { parts, .. } => {
                    bar.finish_with_message(format!("done, {} parts", parts))
                },
                ExportOutcome::Failed { kind, .. } => {
                    bar.abandon_with_message(format!("failed ({})", kind))
                },
            }
        }
    }
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_bar_lifecycle() {
        let progress = BarProgress::new();
        progress.unit_started("orders", Some(10));
        progress.part_written(
            "orders",
            &PartFile {
                sequence: 0,
                path: PathBuf::from("orders/part-00000.parquet"),
                rows: 3,
                bytes: 100,
                sha256: String::new(),
            },
        );
        assert_eq!(
            progress.bars.lock().map(|b| b.get("orders").map(|bar| bar.position())).ok().flatten(),
            Some(3)
        );

        progress.unit_finished(&ExportOutcome::Succeeded {
            table: "orders".to_string(),
            rows: 3,
            parts: 1,
        });
        assert!(progress.bars.lock().map(|b| b.is_empty()).unwrap_or(false));
    }
}
