//! Part file writing
//!
//! A part is encoded in memory, written under a hidden temporary name in the
//! table directory and renamed into place, so a reader listing the directory
//! only ever sees complete `part-NNNNN.<ext>` files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tabex_common::checksum::sha256_bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::codec::{ColumnarCodec, Compression};
use crate::config::RetryPolicy;
use crate::error::{ExportError, Result};
use crate::model::{PartFile, RowBatch};
use crate::schema::ColumnSchema;

const PART_PREFIX: &str = "part-";
const TEMP_PREFIX: &str = ".part-";
const TEMP_SUFFIX: &str = ".tmp";

pub fn part_file_name(sequence: u64, extension: &str) -> String {
    format!("{}{:05}.{}", PART_PREFIX, sequence, extension)
}

fn temp_file_name(sequence: u64, extension: &str) -> String {
    format!("{}{:05}.{}{}", TEMP_PREFIX, sequence, extension, TEMP_SUFFIX)
}

fn is_part_artifact(name: &str, extension: &str) -> bool {
    let published = name.starts_with(PART_PREFIX) && name.ends_with(&format!(".{}", extension));
    let temporary = name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX);
    published || temporary
}

/// Run the codec off the async workers; encoding is CPU bound
async fn encode_blocking(
    codec: Arc<dyn ColumnarCodec>,
    schema: Arc<ColumnSchema>,
    batch: RowBatch,
    compression: Compression,
) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || codec.encode(&schema, &batch, compression))
        .await
        .map_err(|e| ExportError::Encode(format!("encoder task failed: {}", e)))?
}

/// Atomically place already-encoded bytes at their final part name
pub async fn publish_part(
    table_dir: &Path,
    sequence: u64,
    extension: &str,
    bytes: &[u8],
    rows: u64,
) -> Result<PartFile> {
    tokio::fs::create_dir_all(table_dir)
        .await
        .map_err(|e| ExportError::io(table_dir, e))?;

    let temp_path = table_dir.join(temp_file_name(sequence, extension));
    let final_path = table_dir.join(part_file_name(sequence, extension));

    let written: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &final_path).await
    }
    .await;

    if let Err(e) = written {
        if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
            debug!(path = %temp_path.display(), error = %cleanup, "Temp part not removed");
        }
        return Err(ExportError::io(&final_path, e));
    }

    let sha256 = sha256_bytes(bytes);
    debug!(
        path = %final_path.display(),
        part = sequence,
        rows,
        bytes = bytes.len(),
        sha256 = %sha256,
        "Part published"
    );

    Ok(PartFile {
        sequence,
        path: final_path,
        rows,
        bytes: bytes.len() as u64,
        sha256,
    })
}

/// Sequential part writer owned by one export unit
///
/// Sequence numbers start at 0 and advance only when a part is published, so
/// the parts on disk are always contiguous.
pub struct PartWriter {
    table_dir: PathBuf,
    codec: Arc<dyn ColumnarCodec>,
    compression: Compression,
    retry: RetryPolicy,
    next_sequence: u64,
}

impl PartWriter {
    pub fn new(
        table_dir: impl Into<PathBuf>,
        codec: Arc<dyn ColumnarCodec>,
        compression: Compression,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            table_dir: table_dir.into(),
            codec,
            compression,
            retry,
            next_sequence: 0,
        }
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    pub fn parts_written(&self) -> u64 {
        self.next_sequence
    }

    /// Create the table directory and clear parts left by an earlier run
    ///
    /// With `overwrite` off, any leftover part fails the unit instead.
    /// Returns how many files were removed.
    pub async fn prepare(&self, overwrite: bool) -> Result<usize> {
        let dir = &self.table_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ExportError::io(dir, e))?;

        let extension = self.codec.extension();
        let mut stale = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| ExportError::io(dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ExportError::io(dir, e))?
        {
            if is_part_artifact(&entry.file_name().to_string_lossy(), extension) {
                stale.push(entry.path());
            }
        }

        if stale.is_empty() {
            return Ok(0);
        }

        if !overwrite {
            return Err(ExportError::io(
                dir,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("directory already holds {} part files", stale.len()),
                ),
            ));
        }

        for path in &stale {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| ExportError::io(path, e))?;
        }
        info!(dir = %dir.display(), removed = stale.len(), "Removed parts from earlier run");

        Ok(stale.len())
    }

    /// Encode and publish the next part
    pub async fn write(&mut self, schema: &Arc<ColumnSchema>, batch: RowBatch) -> Result<PartFile> {
        let sequence = self.next_sequence;
        let rows = batch.len() as u64;
        let extension = self.codec.extension();
        let bytes =
            encode_blocking(self.codec.clone(), schema.clone(), batch, self.compression).await?;

        let mut attempt = 1;
        loop {
            match publish_part(&self.table_dir, sequence, extension, &bytes, rows).await {
                Ok(part) => {
                    self.next_sequence += 1;
                    return Ok(part);
                },
                Err(err @ ExportError::Io { .. }) if attempt < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        part = sequence,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Part write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(err) => return Err(err),
            }
        }
    }
}
