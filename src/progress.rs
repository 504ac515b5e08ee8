//! Job progress counters and throughput.
//!
//! Totals are fixed when the plan is built. Counters only move forward and
//! are bumped once per task on its final confirmed success, never on an
//! attempt that is later retried. Bytes the destination already had (skipped
//! files, delta-matched blocks, verified resume regions) go to the skip
//! bucket and never count toward throughput.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::record::RelPath;

/// Final state of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Copied in full (possibly resuming from a checkpoint).
    Copied,
    /// Reconstructed from the existing destination plus literals.
    Delta,
    /// Unchanged since the last sync.
    Skipped,
    /// Gave up after retries or on a non-retryable error.
    Failed {
        /// Rendered error.
        error: String,
    },
}

impl FileOutcome {
    /// Whether the file ended in place.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Files in the plan.
    pub total_files: u64,
    /// Bytes in the plan.
    pub total_bytes: u64,
    /// Files copied or delta-synced.
    pub files_transferred: u64,
    /// Files skipped as unchanged.
    pub files_skipped: u64,
    /// Files that failed.
    pub files_failed: u64,
    /// Bytes moved by this job.
    pub bytes_transferred: u64,
    /// Bytes already present at the destination.
    pub bytes_skipped: u64,
    /// Bytes per second over the sliding window.
    pub throughput: f64,
    /// Estimated seconds remaining; absent while throughput is zero.
    pub eta_secs: Option<f64>,
    /// Seconds since the tracker was created.
    pub elapsed_secs: f64,
    /// File most recently started.
    pub current_file: Option<String>,
}

impl ProgressSnapshot {
    /// Share of bytes accounted for, 0-100. An empty plan is complete.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_transferred + self.bytes_skipped) as f64 * 100.0 / self.total_bytes as f64
    }

    /// Bytes not yet accounted for.
    #[must_use]
    pub const fn bytes_remaining(&self) -> u64 {
        self.total_bytes
            .saturating_sub(self.bytes_transferred)
            .saturating_sub(self.bytes_skipped)
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}% ({}/{} files, {} failed) {:.1} MiB/s",
            self.percent(),
            self.files_transferred + self.files_skipped,
            self.total_files,
            self.files_failed,
            self.throughput / (1024.0 * 1024.0)
        )?;
        if let Some(eta) = self.eta_secs {
            write!(f, " eta {eta:.0}s")?;
        }
        Ok(())
    }
}

/// Callback invoked once per finished file.
pub type Observer = Arc<dyn Fn(&RelPath, &FileOutcome, &ProgressSnapshot) + Send + Sync>;

/// Shared progress state for one job.
pub struct ProgressTracker {
    total_files: u64,
    total_bytes: u64,
    files_transferred: AtomicU64,
    files_skipped: AtomicU64,
    files_failed: AtomicU64,
    bytes_transferred: AtomicU64,
    bytes_skipped: AtomicU64,
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
    current_file: Mutex<Option<RelPath>>,
    started: Instant,
    observer: Option<Observer>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// Tracker for a plan of `total_files` files and `total_bytes` bytes,
    /// measuring throughput over `window`.
    #[must_use]
    pub fn new(total_files: u64, total_bytes: u64, window: Duration) -> Self {
        Self {
            total_files,
            total_bytes,
            files_transferred: AtomicU64::new(0),
            files_skipped: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            bytes_skipped: AtomicU64::new(0),
            window: window.max(Duration::from_millis(100)),
            samples: Mutex::new(VecDeque::new()),
            current_file: Mutex::new(None),
            started: Instant::now(),
            observer: None,
        }
    }

    /// Attach a per-file observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Bytes in the plan.
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Record bytes a task moved, on its final success.
    pub fn add_transferred(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back((now, bytes));
        Self::expire(&mut samples, now, self.window);
    }

    /// Record bytes the destination already had.
    pub fn add_skipped(&self, bytes: u64) {
        self.bytes_skipped.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Note the file a worker just started.
    pub fn set_current_file(&self, path: &RelPath) {
        *self.current_file.lock().unwrap_or_else(PoisonError::into_inner) = Some(path.clone());
    }

    /// Record a finished file and notify the observer.
    pub fn finish_file(&self, path: &RelPath, outcome: &FileOutcome) {
        let counter = match outcome {
            FileOutcome::Copied | FileOutcome::Delta => &self.files_transferred,
            FileOutcome::Skipped => &self.files_skipped,
            FileOutcome::Failed { .. } => &self.files_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer(path, outcome, &self.snapshot());
        }
    }

    fn expire(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some(&(at, _)) = samples.front() {
            if now.duration_since(at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second transferred within the window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        Self::expire(&mut samples, now, self.window);
        let bytes: u64 = samples.iter().map(|(_, b)| b).sum();
        if bytes == 0 {
            return 0.0;
        }
        let span = self
            .window
            .min(now.duration_since(self.started))
            .max(Duration::from_millis(10));
        bytes as f64 / span.as_secs_f64()
    }

    /// Consistent-enough view of all counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let throughput = self.throughput();
        let mut snapshot = ProgressSnapshot {
            total_files: self.total_files,
            total_bytes: self.total_bytes,
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            bytes_skipped: self.bytes_skipped.load(Ordering::Relaxed),
            throughput,
            eta_secs: None,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            current_file: self
                .current_file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|p| p.display().into_owned()),
        };
        let remaining = snapshot.bytes_remaining();
        snapshot.eta_secs = if remaining == 0 {
            Some(0.0)
        } else if throughput > 0.0 {
            Some(remaining as f64 / throughput)
        } else {
            None
        };
        snapshot
    }
}
