//! # Chunksync
//!
//! Parallel chunked copy, delta sync, bandwidth throttling and
//! checkpoint/resume for large file trees.
//!
//! A job scans a source tree, plans every file against a manifest of the
//! previous sync, and moves the remaining bytes through a work-stealing
//! pool. Large files are split into chunks copied in parallel; changed files
//! that already exist at the destination are rebuilt from their old content
//! with the rsync algorithm. Every byte written passes a shared token bucket,
//! optionally driven by a time-of-day schedule, and progress is checkpointed
//! so an interrupted job resumes where it stopped.
//!
//! ## Features
//!
//! - **Rolling Checksum**: Adler-32 variant for O(1) window sliding
//! - **Strong Hash**: BLAKE3 for block and whole-file verification
//! - **Delta Sync**: streaming delta against the destination's old content
//! - **Chunked Copy**: positional I/O over independent byte ranges
//! - **Throttling**: lock-free token bucket with scheduled limits
//! - **Resume**: verified checkpoints per file
//!
//! ## Example
//!
//! ```rust
//! use chunksync::{DeltaEngine, SignatureTable};
//!
//! let basis = b"original file content, long enough to span blocks".repeat(64);
//! let mut source = basis.clone();
//! source[100..108].copy_from_slice(b"modified");
//!
//! let engine = DeltaEngine::new(512).unwrap();
//! let table = SignatureTable::from_slice(&basis, 512).unwrap();
//! let delta = engine.delta(&mut source.as_slice(), &table).unwrap();
//!
//! let mut output = Vec::new();
//! delta.apply(&mut std::io::Cursor::new(&basis), &mut output).unwrap();
//! assert_eq!(output, source);
//! assert!(delta.bytes_literal() <= 512);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod async_sync;
mod checkpoint;
mod checksum;
mod chunk;
mod config;
mod delta;
mod engine;
mod error;
mod executor;
mod hash;
mod manifest;
mod planner;
mod pool;
mod progress;
mod record;
mod scan;
mod schedule;
mod signature;
mod throttle;
mod transport;
mod verify;

pub use async_sync::AsyncDeltaEngine;
pub use checkpoint::{transfer_id, Checkpoint, CheckpointStore, ResumePoint};
pub use checksum::RollingChecksum;
pub use chunk::{effective_chunk_size, split_ranges, ChunkPlanner, ChunkRange, FileId, TaskKind, TransferTask};
pub use config::{parse_size, SyncBuilder, SyncConfig};
pub use delta::{validate_copy, Delta, DeltaEngine, DeltaOp, DeltaStats};
pub use engine::{sync_dirs, throttle_for, FileReport, JobReport, JobStatus, SyncEngine};
pub use error::{Result, SyncError};
pub use executor::{CopyExecutor, DeltaOutcome, STAGING_SUFFIX};
pub use hash::{ContentHasher, StrongHash};
pub use manifest::{ManifestEntry, ManifestFormat, ManifestStore, MANIFEST_VERSION};
pub use planner::{PlannedFile, Planner, SyncAction, SyncPlan};
pub use pool::{CancelToken, RetryPolicy, TaskReport, WorkerPool};
pub use progress::{FileOutcome, Observer, ProgressSnapshot, ProgressTracker};
pub use record::{FileRecord, Mtime, RelPath};
pub use scan::{OrderingStrategy, PathFilter, ScanIter, ScanOptions, ScanOutcome, Scanner};
pub use schedule::{Schedule, ScheduleRule, ScheduledThrottle};
pub use signature::{
    validate_block_size, ChunkSignature, SignatureTable, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
pub use throttle::{parse_rate, RateLimit, TokenBucket, Unlimited};
pub use transport::{FileStat, HandleReader, LocalTransport, ReadHandle, Transport, WriteHandle};
pub use verify::{hash_range, Verifier};
