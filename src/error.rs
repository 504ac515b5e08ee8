//! Error types for chunksync operations.
//!
//! A single [`SyncError`] covers the whole engine. Variants are grouped by how
//! the job reacts to them: per-entry scan errors are recorded and skipped,
//! transport and short-write errors are retried, verification mismatches fail
//! one file, and manifest or destination-root errors abort the job.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error not attributable to a specific transfer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single directory entry could not be read during scanning.
    #[error("Scan error at '{path}': {message}")]
    Scan {
        /// Entry that failed
        path: PathBuf,
        /// Underlying cause
        message: String,
    },

    /// A transport read, write, open or stat failed.
    #[error("Transport error at '{path}': {source}")]
    Transport {
        /// File being transferred
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The destination accepted fewer bytes than requested.
    #[error("Short write at '{path}' offset {offset}: requested {expected} bytes, wrote {written}")]
    ShortWrite {
        /// File being written
        path: PathBuf,
        /// Offset of the write
        offset: u64,
        /// Bytes requested
        expected: usize,
        /// Bytes the transport reported as written
        written: usize,
    },

    /// Destination content does not hash identically to the source.
    #[error("Verification failed for '{path}': expected {expected}, got {actual}")]
    VerificationMismatch {
        /// File that failed verification
        path: PathBuf,
        /// Source hash (hex)
        expected: String,
        /// Destination hash (hex)
        actual: String,
    },

    /// Block signatures could not be computed for the existing destination.
    #[error("Delta signature error for '{path}': {message}")]
    DeltaSignature {
        /// File whose destination could not be signed
        path: PathBuf,
        /// Underlying cause
        message: String,
    },

    /// Malformed bandwidth schedule.
    #[error("Schedule configuration error: {0}")]
    ScheduleConfig(String),

    /// Checkpoint file exists but cannot be decoded.
    #[error("Corrupt checkpoint '{path}': {message}")]
    CheckpointCorrupt {
        /// Checkpoint file
        path: PathBuf,
        /// Decode error
        message: String,
    },

    /// Manifest store could not be read or written.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// The destination root cannot be written.
    #[error("Destination '{path}' is not writable: {source}")]
    DestinationUnwritable {
        /// Destination root
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Delta block size out of range.
    #[error("Invalid block size: {0} (must be power of 2, 512-1048576)")]
    InvalidBlockSize(usize),

    /// Delta contains a copy instruction past the end of the basis.
    #[error("Invalid copy bounds: offset {offset} + len {len} exceeds basis size {basis_size}")]
    InvalidCopyBounds {
        /// Copy offset in basis file
        offset: u64,
        /// Copy length
        len: u32,
        /// Total basis file size
        basis_size: u64,
    },

    /// Job was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Wrap an I/O error raised while transferring `path`.
    pub fn transport(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Transport {
            path: path.into(),
            source,
        }
    }

    /// Build a scan error for `path`.
    pub fn scan(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Scan {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a delta-signature error for `path`.
    pub fn delta_signature(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::DeltaSignature {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether a fresh attempt of the same task may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ShortWrite { .. } | Self::Io(_)
        )
    }

    /// Whether the whole job must stop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Manifest(_)
                | Self::DestinationUnwritable { .. }
                | Self::ScheduleConfig(_)
                | Self::Config(_)
        )
    }
}

/// Result type for chunksync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
