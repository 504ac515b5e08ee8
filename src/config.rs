//! Job configuration.
//!
//! [`SyncConfig`] is a plain serde struct with defaults; [`SyncBuilder`] sets
//! fields fluently and validates in [`SyncBuilder::build`]. A config can also
//! be loaded from a JSON file with [`SyncConfig::load`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::scan::{OrderingStrategy, ScanOptions};
use crate::signature::{validate_block_size, DEFAULT_BLOCK_SIZE};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Settings for one sync job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Worker threads; 0 uses the available parallelism.
    pub threads: usize,
    /// Files at or above this size are split into chunks.
    pub chunk_threshold: u64,
    /// Chunk length for split files.
    pub chunk_size: u64,
    /// Read/write buffer per worker.
    pub buffer_size: usize,
    /// Retries per task after the first attempt.
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Skip files whose size and mtime match the manifest.
    pub incremental: bool,
    /// Use delta transfer for changed files with an existing destination.
    pub delta: bool,
    /// Delta block size (power of two, 512 B to 1 MiB).
    pub delta_block_size: usize,
    /// Smallest file considered for delta transfer.
    pub delta_min_size: u64,
    /// Keep block signatures in the manifest.
    pub store_signatures: bool,
    /// Checkpoint at least every this many bytes.
    pub checkpoint_interval: u64,
    /// Checkpoints older than this are removed by cleanup, in seconds.
    pub checkpoint_max_age_secs: u64,
    /// Directory for checkpoint files; `None` disables resume.
    pub checkpoint_dir: Option<PathBuf>,
    /// Manifest file; `None` keeps the manifest in memory only.
    pub manifest_path: Option<PathBuf>,
    /// Fixed bandwidth limit in bytes per second; 0 is unlimited.
    pub bandwidth_limit: u64,
    /// Bandwidth schedule file; overrides `bandwidth_limit` when set.
    pub schedule_path: Option<PathBuf>,
    /// Re-hash source and destination after each file.
    pub verify: bool,
    /// Copy permission bits.
    pub preserve_permissions: bool,
    /// Copy modification times.
    pub preserve_times: bool,
    /// Plan and report without writing anything.
    pub dry_run: bool,
    /// Remove destination files that no longer exist at the source.
    pub delete_extra: bool,
    /// Sliding window for throughput, in seconds.
    pub throughput_window_secs: u64,
    /// Scanner filters and ordering.
    pub scan: ScanOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            chunk_threshold: GIB,
            chunk_size: 64 * MIB,
            buffer_size: MIB as usize,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            incremental: true,
            delta: true,
            delta_block_size: DEFAULT_BLOCK_SIZE,
            delta_min_size: 0,
            store_signatures: false,
            checkpoint_interval: 64 * MIB,
            checkpoint_max_age_secs: 7 * 24 * 3600,
            checkpoint_dir: None,
            manifest_path: None,
            bandwidth_limit: 0,
            schedule_path: None,
            verify: true,
            preserve_permissions: true,
            preserve_times: true,
            dry_run: false,
            delete_extra: false,
            throughput_window_secs: 5,
            scan: ScanOptions::default(),
        }
    }
}

impl SyncConfig {
    /// Load and validate a JSON config file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| SyncError::config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SyncError::config("chunk_size must be greater than zero"));
        }
        if self.chunk_threshold == 0 {
            return Err(SyncError::config("chunk_threshold must be greater than zero"));
        }
        if self.buffer_size == 0 {
            return Err(SyncError::config("buffer_size must be greater than zero"));
        }
        if self.checkpoint_interval == 0 {
            return Err(SyncError::config("checkpoint_interval must be greater than zero"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(SyncError::config("retry_base_delay_ms exceeds retry_max_delay_ms"));
        }
        if self.throughput_window_secs == 0 {
            return Err(SyncError::config("throughput_window_secs must be greater than zero"));
        }
        validate_block_size(self.delta_block_size)
            .map_err(|_| SyncError::config(format!("invalid delta_block_size {}", self.delta_block_size)))
    }

    /// Worker count with 0 resolved to the available parallelism.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
    }

    /// Base retry delay.
    #[must_use]
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry delay ceiling.
    #[must_use]
    pub const fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Checkpoint age limit.
    #[must_use]
    pub const fn checkpoint_max_age(&self) -> Duration {
        Duration::from_secs(self.checkpoint_max_age_secs)
    }

    /// Throughput window.
    #[must_use]
    pub const fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs)
    }
}

/// Fluent builder for [`SyncConfig`].
///
/// # Example
///
/// ```rust
/// use chunksync::SyncBuilder;
///
/// let config = SyncBuilder::new()
///     .threads(4)
///     .chunk_size(8 * 1024 * 1024)
///     .bandwidth_limit(50 * 1024 * 1024)
///     .build()
///     .unwrap();
/// assert_eq!(config.threads, 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SyncBuilder {
    config: SyncConfig,
}

impl SyncBuilder {
    /// Builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    #[must_use]
    pub fn from_config(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Worker thread count (0 = auto).
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = threads;
        self
    }

    /// Size at which files are split into chunks.
    #[must_use]
    pub fn chunk_threshold(mut self, bytes: u64) -> Self {
        self.config.chunk_threshold = bytes;
        self
    }

    /// Chunk length.
    #[must_use]
    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.config.chunk_size = bytes;
        self
    }

    /// I/O buffer size.
    #[must_use]
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.config.buffer_size = bytes;
        self
    }

    /// Retry limit and backoff bounds.
    #[must_use]
    pub fn retries(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_base_delay_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.config.retry_max_delay_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Incremental skipping by size and mtime.
    #[must_use]
    pub fn incremental(mut self, enabled: bool) -> Self {
        self.config.incremental = enabled;
        self
    }

    /// Delta transfer for changed files.
    #[must_use]
    pub fn delta(mut self, enabled: bool) -> Self {
        self.config.delta = enabled;
        self
    }

    /// Delta block size.
    #[must_use]
    pub fn delta_block_size(mut self, bytes: usize) -> Self {
        self.config.delta_block_size = bytes;
        self
    }

    /// Minimum file size for delta transfer.
    #[must_use]
    pub fn delta_min_size(mut self, bytes: u64) -> Self {
        self.config.delta_min_size = bytes;
        self
    }

    /// Keep block signatures in the manifest.
    #[must_use]
    pub fn store_signatures(mut self, enabled: bool) -> Self {
        self.config.store_signatures = enabled;
        self
    }

    /// Checkpoint directory and interval.
    #[must_use]
    pub fn checkpoints(mut self, dir: impl Into<PathBuf>, interval: u64) -> Self {
        self.config.checkpoint_dir = Some(dir.into());
        self.config.checkpoint_interval = interval;
        self
    }

    /// Manifest file.
    #[must_use]
    pub fn manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.manifest_path = Some(path.into());
        self
    }

    /// Fixed bandwidth limit (0 = unlimited).
    #[must_use]
    pub fn bandwidth_limit(mut self, bytes_per_sec: u64) -> Self {
        self.config.bandwidth_limit = bytes_per_sec;
        self
    }

    /// Bandwidth schedule file.
    #[must_use]
    pub fn schedule(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.schedule_path = Some(path.into());
        self
    }

    /// Post-copy verification.
    #[must_use]
    pub fn verify(mut self, enabled: bool) -> Self {
        self.config.verify = enabled;
        self
    }

    /// Copy modification times.
    #[must_use]
    pub fn preserve_times(mut self, enabled: bool) -> Self {
        self.config.preserve_times = enabled;
        self
    }

    /// Plan and report only.
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.config.dry_run = enabled;
        self
    }

    /// Delete destination files missing from the source.
    #[must_use]
    pub fn delete_extra(mut self, enabled: bool) -> Self {
        self.config.delete_extra = enabled;
        self
    }

    /// File ordering.
    #[must_use]
    pub fn ordering(mut self, ordering: OrderingStrategy) -> Self {
        self.config.scan.ordering = ordering;
        self
    }

    /// Scanner filters.
    #[must_use]
    pub fn scan_options(mut self, scan: ScanOptions) -> Self {
        self.config.scan = scan;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] for out-of-range values.
    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parse a human byte size such as `"512K"`, `"100M"`, `"1.5G"` or `"64MiB"`.
///
/// Suffixes are binary multiples; a bare number is bytes.
///
/// # Errors
///
/// Returns [`SyncError::Config`] for malformed input.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| SyncError::config(format!("invalid size '{input}'")))?;

    let multiplier = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KIB,
        "M" | "MB" | "MIB" => MIB,
        "G" | "GB" | "GIB" => GIB,
        "T" | "TB" | "TIB" => 1024 * GIB,
        other => return Err(SyncError::config(format!("unknown size suffix '{other}' in '{input}'"))),
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 {
        return Err(SyncError::config(format!("invalid size '{input}'")));
    }
    // saturating float-to-int cast
    Ok(bytes.min(u64::MAX as f64) as u64)
}
