//! Export run configuration

use std::time::Duration;

use crate::codec::Compression;
use crate::error::{ExportError, Result};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Rows per batch, and therefore per part file
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// Export units running at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Retry policy for part writes
///
/// Only `Io` failures while publishing an already-encoded part are retried,
/// and the retry rewrites the whole part under the same sequence number.
/// Adapters never retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay before attempt `attempt` (1-based); grows linearly
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * attempt.saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Connection pool settings for the cursor source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub url: String,
    /// Defaults to the run's `max_concurrency`
    pub max_connections: Option<u32>,
    pub connect_timeout: Duration,
}

impl DatabaseSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Pool size for a run with the given concurrency
    pub fn pool_size(&self, max_concurrency: usize) -> u32 {
        self.max_connections
            .unwrap_or_else(|| u32::try_from(max_concurrency).unwrap_or(u32::MAX))
            .max(1)
    }
}

/// Settings shared by every export unit of a run
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Upper bound on rows per batch and per part
    pub chunk_size: usize,

    /// Export units allowed to run at once
    pub max_concurrency: usize,

    pub compression: Compression,

    /// Remove part files left by an earlier run before writing
    pub overwrite: bool,

    pub retry: RetryPolicy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            compression: Compression::default(),
            overwrite: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl ExportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ExportError::Config("chunk size must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(ExportError::Config(
                "max concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ExportError::Config(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExportConfig::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.compression, Compression::Fast);
        assert!(config.overwrite);
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(ExportConfig::new().with_chunk_size(0).validate().is_err());
        assert!(ExportConfig::new()
            .with_max_concurrency(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_retry_delay_grows() {
        let retry = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::ZERO);
        assert_eq!(retry.delay_for(3), Duration::from_millis(200));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_pool_size_follows_concurrency() {
        let settings = DatabaseSettings::new("sqlite::memory:");
        assert_eq!(settings.pool_size(6), 6);
        assert_eq!(settings.clone().with_max_connections(2).pool_size(6), 2);
        assert_eq!(settings.pool_size(0), 1);
    }
}
