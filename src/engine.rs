//! Job orchestration.
//!
//! A job scans, plans against the manifest, verifies any checkpoints left by
//! an interrupted run, and hands the remaining work to the worker pool. The
//! calling thread collects task reports and is the only writer of per-file
//! outcomes; the manifest is updated once, at the end.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{transfer_id, CheckpointStore, ResumePoint};
use crate::chunk::{ChunkPlanner, ChunkRange, TaskKind, TransferTask};
use crate::config::SyncConfig;
use crate::delta::DeltaEngine;
use crate::error::{Result, SyncError};
use crate::executor::CopyExecutor;
use crate::hash::StrongHash;
use crate::manifest::{ManifestEntry, ManifestStore};
use crate::planner::{PlannedFile, Planner, SyncAction};
use crate::pool::{CancelToken, RetryPolicy, WorkerPool};
use crate::progress::{FileOutcome, Observer, ProgressSnapshot, ProgressTracker};
use crate::record::{FileRecord, RelPath};
use crate::scan::{PathFilter, Scanner};
use crate::schedule::{Schedule, ScheduledThrottle};
use crate::signature::SignatureTable;
use crate::throttle::{RateLimit, TokenBucket, Unlimited};
use crate::transport::{LocalTransport, Transport};

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every file is in place.
    Completed,
    /// At least one file failed; the rest are in place.
    CompletedWithFailures,
    /// Stopped by a [`CancelToken`]; checkpoints allow resuming.
    Cancelled,
}

/// Per-file line of a [`JobReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    /// Relative path.
    pub path: RelPath,
    /// Planned size.
    pub size: u64,
    /// Planned action.
    pub action: &'static str,
    /// Final outcome; absent when the job was cancelled first or was a
    /// dry run.
    pub outcome: Option<FileOutcome>,
}

/// Summary of a finished job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Id matching checkpoints to this source/destination pair.
    pub transfer_id: String,
    /// Overall status.
    pub status: JobStatus,
    /// Final counters.
    pub progress: ProgressSnapshot,
    /// Every planned file in scheduling order.
    pub files: Vec<FileReport>,
    /// Entries the scanner could not read.
    pub scan_errors: Vec<String>,
    /// Extraneous destination files removed, or that would be on a dry run.
    pub deleted: Vec<RelPath>,
    /// Extraneous files that could not be removed.
    pub delete_errors: Vec<String>,
    /// Nothing was written.
    pub dry_run: bool,
    /// Wall-clock seconds.
    pub elapsed_secs: f64,
}

impl JobReport {
    /// Files that failed.
    pub fn failures(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, Some(FileOutcome::Failed { .. })))
    }
}

/// Runtime state of one planned file.
struct FileState {
    record: FileRecord,
    action: SyncAction,
    /// Chunk ranges; empty when the file moves as one task.
    ranges: Vec<ChunkRange>,
    /// Length of full chunks; 0 when not chunked.
    chunk_size: u64,
    resume: ResumePoint,
    landed: Vec<AtomicBool>,
    remaining: AtomicUsize,
}

impl FileState {
    fn is_chunked(&self) -> bool {
        !self.ranges.is_empty()
    }
}

/// What a successful task contributes.
struct TaskDone {
    transferred: u64,
    skipped: u64,
    file: Option<FileDone>,
}

/// A file that reached its final state.
struct FileDone {
    outcome: FileOutcome,
    hash: StrongHash,
    signature: Option<SignatureTable>,
}

/// Sync engine over a source and destination transport.
///
/// # Example
///
/// ```rust,no_run
/// use chunksync::{LocalTransport, Scanner, SyncBuilder, SyncEngine};
///
/// let config = SyncBuilder::new().threads(4).build()?;
/// let scanner = Scanner::new("/data/src", config.scan.clone())?;
/// let engine = SyncEngine::new(
///     LocalTransport::new("/data/src"),
///     LocalTransport::new("/backup/dst"),
///     config,
/// )?;
/// let report = engine.run(scanner.iter())?;
/// println!("{:?}: {}", report.status, report.progress);
/// # Ok::<(), chunksync::SyncError>(())
/// ```
pub struct SyncEngine<S, D> {
    source: S,
    dest: D,
    config: SyncConfig,
    manifest: ManifestStore,
    checkpoints: Option<CheckpointStore>,
    throttle: Arc<dyn RateLimit>,
    cancel: CancelToken,
    observer: Option<Observer>,
    filter: PathFilter,
    transfer_id: String,
    progress: Mutex<Option<Arc<ProgressTracker>>>,
}

/// Throttle described by `config`: a schedule, a fixed limit, or none.
///
/// # Errors
///
/// [`SyncError::ScheduleConfig`] if the schedule file is invalid.
pub fn throttle_for(config: &SyncConfig) -> Result<Arc<dyn RateLimit>> {
    if let Some(path) = &config.schedule_path {
        let schedule = Schedule::load(path)?;
        let bucket = Arc::new(TokenBucket::new(schedule.default_limit));
        return Ok(Arc::new(ScheduledThrottle::new(schedule, bucket)));
    }
    if config.bandwidth_limit > 0 {
        return Ok(Arc::new(TokenBucket::new(config.bandwidth_limit)));
    }
    Ok(Arc::new(Unlimited))
}

impl<S: Transport, D: Transport> SyncEngine<S, D> {
    /// Engine for one source/destination pair.
    ///
    /// # Errors
    ///
    /// Invalid configuration, an unreadable manifest or schedule, or a
    /// checkpoint directory that cannot be created.
    pub fn new(source: S, dest: D, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let manifest = match &config.manifest_path {
            Some(path) => ManifestStore::open(path)?,
            None => ManifestStore::in_memory(),
        };
        let checkpoints = config
            .checkpoint_dir
            .as_ref()
            .map(|dir| CheckpointStore::open(dir))
            .transpose()?;
        let throttle = throttle_for(&config)?;
        let filter = PathFilter::new(&config.scan)?;
        let root = RelPath::from("");
        let transfer_id = transfer_id(&source.describe(&root), &dest.describe(&root));
        Ok(Self {
            source,
            dest,
            config,
            manifest,
            checkpoints,
            throttle,
            cancel: CancelToken::new(),
            observer: None,
            filter,
            transfer_id,
            progress: Mutex::new(None),
        })
    }

    /// Use a shared rate limiter, e.g. one bucket across several jobs.
    #[must_use]
    pub fn with_throttle(mut self, throttle: Arc<dyn RateLimit>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Notify `observer` as each file finishes.
    #[must_use]
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Token that cancels this engine's jobs.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Id shared by checkpoints of this source/destination pair.
    #[must_use]
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    /// Manifest consulted and updated by jobs.
    #[must_use]
    pub const fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// Checkpoint store, when checkpointing is enabled.
    #[must_use]
    pub const fn checkpoints(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref()
    }

    /// Job configuration.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Counters of the running or last job.
    #[must_use]
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.snapshot())
    }

    /// Run one job over `scan`.
    ///
    /// Per-entry scan errors are recorded in the report. Files that fail
    /// after retries are reported without stopping the job. With
    /// `delete_extra`, destination files missing from the source are removed
    /// once transfers finish, unless the scan reported errors. A dry run
    /// stops after planning and writes nothing.
    ///
    /// # Errors
    ///
    /// Fatal conditions only: an unwritable destination, a manifest that
    /// cannot be saved, or any other error classified as fatal.
    pub fn run<I>(&self, scan: I) -> Result<JobReport>
    where
        I: IntoIterator<Item = Result<FileRecord>>,
    {
        let started = Instant::now();
        let root = RelPath::from("");
        let dry_run = self.config.dry_run;
        if !dry_run {
            self.dest
                .prepare()
                .map_err(|source| SyncError::DestinationUnwritable {
                    path: self.dest.describe(&root),
                    source,
                })?;

            if let Some(store) = &self.checkpoints {
                if let Err(e) = store.cleanup(self.config.checkpoint_max_age()) {
                    warn!(error = %e, "checkpoint cleanup failed");
                }
            }
        }

        let mut records = Vec::new();
        let mut scan_errors = Vec::new();
        for item in scan {
            match item {
                Ok(record) => records.push(record),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "scan entry skipped");
                    scan_errors.push(e.to_string());
                }
            }
        }
        self.config.scan.ordering.apply(&mut records);

        let planner = Planner::new(&self.manifest, &self.config);
        let plan = planner.plan(records, &self.dest);
        let mut deletions = planner
            .extraneous(&plan, &self.filter, &self.source, &self.dest)
            .unwrap_or_else(|e| {
                warn!(error = %e, "cannot list destination, skipping deletion");
                Vec::new()
            });
        if !scan_errors.is_empty() && !deletions.is_empty() {
            warn!(count = deletions.len(), "scan reported errors, skipping deletion");
            deletions.clear();
        }
        let mut tracker = ProgressTracker::new(plan.total_files(), plan.total_bytes, self.config.throughput_window());
        if let Some(observer) = &self.observer {
            tracker = tracker.with_observer(Arc::clone(observer));
        }
        let progress = Arc::new(tracker);
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&progress));

        let (skip_files, skip_bytes) = plan.skipped();
        info!(
            transfer_id = %self.transfer_id,
            files = plan.total_files(),
            bytes = plan.total_bytes,
            skip_files,
            skip_bytes,
            delta_files = plan.delta_count(),
            delete_files = deletions.len(),
            dry_run,
            "job planned"
        );

        if dry_run {
            let files = plan
                .files
                .into_iter()
                .map(|planned| FileReport {
                    size: planned.record.size,
                    action: planned.action.label(),
                    path: planned.record.path,
                    outcome: None,
                })
                .collect();
            return Ok(JobReport {
                transfer_id: self.transfer_id.clone(),
                status: JobStatus::Completed,
                progress: progress.snapshot(),
                files,
                scan_errors,
                deleted: deletions,
                delete_errors: Vec::new(),
                dry_run: true,
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }

        let executor = CopyExecutor::new(&self.source, &self.dest, &*self.throttle, &self.config)
            .with_cancel(self.cancel.clone());
        let executor = match &self.checkpoints {
            Some(store) => executor.with_checkpoints(store, &self.transfer_id),
            None => executor,
        };
        let chunker = ChunkPlanner::new(self.config.chunk_threshold, self.config.chunk_size);
        let delta_engine = DeltaEngine::new(self.config.delta_block_size)?;

        let states: Vec<FileState> = plan
            .files
            .into_par_iter()
            .map(|planned| self.prepare_file(planned, &chunker, &executor))
            .collect();

        let mut outcomes: Vec<Option<FileOutcome>> = vec![None; states.len()];
        let mut entries: Vec<ManifestEntry> = Vec::new();
        let mut tasks: Vec<TransferTask> = Vec::new();

        for (id, state) in states.iter().enumerate() {
            let path = &state.record.path;
            let order_key = id as u64;
            match state.action {
                SyncAction::Skip => {
                    progress.add_skipped(state.record.size);
                    progress.finish_file(path, &FileOutcome::Skipped);
                    outcomes[id] = Some(FileOutcome::Skipped);
                    continue;
                }
                _ => progress.add_skipped(state.resume.bytes_satisfied(&state.ranges)),
            }
            if !state.is_chunked() {
                tasks.push(TransferTask {
                    file: id,
                    kind: TaskKind::Whole,
                    attempt: 0,
                    order_key,
                });
                continue;
            }
            if state.remaining.load(Ordering::Acquire) == 0 {
                // Every chunk was already verified in place.
                let done = executor
                    .finish_chunked(&state.record)
                    .and_then(|hash| self.finish_file(state, &executor, &delta_engine, hash, FileOutcome::Copied));
                self.settle(id, state, done, &progress, &mut outcomes, &mut entries);
                continue;
            }
            for (range, landed) in state.ranges.iter().zip(&state.landed) {
                if !landed.load(Ordering::Acquire) {
                    tasks.push(TransferTask {
                        file: id,
                        kind: TaskKind::Chunk {
                            index: range.index,
                            offset: range.offset,
                            len: range.len,
                        },
                        attempt: 0,
                        order_key,
                    });
                }
            }
        }
        tasks.sort_by_key(|t| t.order_key);

        let retry = RetryPolicy {
            max_retries: self.config.max_retries,
            base_delay: self.config.retry_base_delay(),
            max_delay: self.config.retry_max_delay(),
        };
        let pool = WorkerPool::new(self.config.worker_threads(), retry, self.cancel.clone());
        let mut cancelled = false;
        let mut fatal: Option<SyncError> = None;

        pool.run(
            tasks,
            |task| {
                let state = &states[task.file];
                progress.set_current_file(&state.record.path);
                match task.kind {
                    TaskKind::Whole => self.run_whole(state, &executor, &delta_engine),
                    TaskKind::Chunk { index, offset, len } => {
                        self.run_chunk(state, ChunkRange { index, offset, len }, &executor, &delta_engine)
                    }
                }
            },
            |report| {
                let id = report.task.file;
                match report.result {
                    Ok(done) => {
                        progress.add_transferred(done.transferred);
                        progress.add_skipped(done.skipped);
                        if let Some(file) = done.file {
                            self.settle(id, &states[id], Ok(file), &progress, &mut outcomes, &mut entries);
                        }
                    }
                    Err(SyncError::Cancelled) => cancelled = true,
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "fatal error, stopping job");
                        self.cancel.cancel();
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        if outcomes[id].is_none() {
                            self.settle(id, &states[id], Err(e), &progress, &mut outcomes, &mut entries);
                        }
                    }
                }
            },
        );

        if let Some(e) = fatal {
            return Err(e);
        }
        cancelled |= self.cancel.is_cancelled();

        let mut deleted = Vec::new();
        let mut delete_errors = Vec::new();
        if !cancelled {
            for path in deletions {
                match self.dest.remove(&path) {
                    Ok(()) => {
                        info!(path = %path, "deleted extraneous file");
                        self.manifest.remove(&path);
                        deleted.push(path);
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "cannot delete extraneous file");
                        delete_errors.push(format!("{}: {e}", self.dest.describe(&path).display()));
                    }
                }
            }
        }

        for entry in entries {
            self.manifest.upsert(entry);
        }
        for (state, outcome) in states.iter().zip(&outcomes) {
            if matches!(outcome, Some(FileOutcome::Failed { .. })) {
                self.manifest.remove(&state.record.path);
            }
        }
        self.manifest.save()?;

        let snapshot = progress.snapshot();
        let status = if cancelled {
            JobStatus::Cancelled
        } else if snapshot.files_failed > 0 || !delete_errors.is_empty() {
            JobStatus::CompletedWithFailures
        } else {
            JobStatus::Completed
        };
        let elapsed = started.elapsed();
        info!(
            status = ?status,
            transferred = snapshot.bytes_transferred,
            skipped = snapshot.bytes_skipped,
            failed = snapshot.files_failed,
            deleted = deleted.len(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "job finished"
        );

        let files = states
            .into_iter()
            .zip(outcomes)
            .map(|(state, outcome)| FileReport {
                size: state.record.size,
                action: state.action.label(),
                path: state.record.path,
                outcome,
            })
            .collect();
        Ok(JobReport {
            transfer_id: self.transfer_id.clone(),
            status,
            progress: snapshot,
            files,
            scan_errors,
            deleted,
            delete_errors,
            dry_run: false,
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }

    /// Work out chunking and any verified resume point for one file.
    fn prepare_file(
        &self,
        planned: PlannedFile,
        chunker: &ChunkPlanner,
        executor: &CopyExecutor<'_, S, D>,
    ) -> FileState {
        let PlannedFile { record, action } = planned;
        let full = action == SyncAction::Full;
        let ranges = if full { chunker.ranges(record.size) } else { Vec::new() };
        let chunk_size = if ranges.is_empty() { 0 } else { chunker.chunk_size_for(record.size) };
        let resume = if full {
            self.resume_point(&record, &ranges, chunk_size, executor)
        } else {
            ResumePoint::Fresh
        };
        let landed: Vec<AtomicBool> = ranges
            .iter()
            .map(|r| AtomicBool::new(matches!(&resume, ResumePoint::Chunks(done) if done.contains(&r.index))))
            .collect();
        let remaining = landed.iter().filter(|l| !l.load(Ordering::Relaxed)).count();
        FileState {
            record,
            action,
            ranges,
            chunk_size,
            resume,
            landed,
            remaining: AtomicUsize::new(remaining),
        }
    }

    fn resume_point(
        &self,
        record: &FileRecord,
        ranges: &[ChunkRange],
        chunk_size: u64,
        executor: &CopyExecutor<'_, S, D>,
    ) -> ResumePoint {
        let Some(store) = &self.checkpoints else {
            return ResumePoint::Fresh;
        };
        let Some(checkpoint) = store.load(&self.transfer_id, &record.path) else {
            return ResumePoint::Fresh;
        };
        let point = if checkpoint.matches(&self.transfer_id, &record.path, record.size, chunk_size) {
            checkpoint
                .verify(executor.verifier(), &self.source, &self.dest, ranges)
                .unwrap_or_else(|e| {
                    warn!(path = %record.path, error = %e, "cannot verify checkpoint, restarting file");
                    ResumePoint::Fresh
                })
        } else {
            debug!(path = %record.path, "checkpoint describes a different transfer, discarding");
            ResumePoint::Fresh
        };
        if point == ResumePoint::Fresh {
            if let Err(e) = store.remove(&self.transfer_id, &record.path) {
                warn!(path = %record.path, error = %e, "cannot remove stale checkpoint");
            }
        } else {
            info!(path = %record.path, satisfied = point.bytes_satisfied(ranges), "resuming from checkpoint");
        }
        point
    }

    fn run_whole(
        &self,
        state: &FileState,
        executor: &CopyExecutor<'_, S, D>,
        engine: &DeltaEngine,
    ) -> Result<TaskDone> {
        let record = &state.record;
        if let SyncAction::Delta { cached } = &state.action {
            match executor.sync_delta(record, engine, cached.as_ref()) {
                Ok(outcome) => {
                    let transferred = outcome.bytes_literal.min(record.size);
                    let file = self.finish_file(state, executor, engine, outcome.hash, FileOutcome::Delta)?;
                    return Ok(TaskDone {
                        transferred,
                        skipped: record.size - transferred,
                        file: Some(file),
                    });
                }
                Err(e @ (SyncError::DeltaSignature { .. } | SyncError::VerificationMismatch { .. })) => {
                    warn!(path = %record.path, error = %e, "delta unavailable, copying whole file");
                }
                Err(e) => return Err(e),
            }
        }

        let resume = match state.resume {
            ResumePoint::Offset(offset) => offset.min(record.size),
            _ => 0,
        };
        let hash = executor.copy_whole(record, resume)?;
        let file = self.finish_file(state, executor, engine, hash, FileOutcome::Copied)?;
        Ok(TaskDone {
            transferred: record.size - resume,
            skipped: 0,
            file: Some(file),
        })
    }

    fn run_chunk(
        &self,
        state: &FileState,
        range: ChunkRange,
        executor: &CopyExecutor<'_, S, D>,
        engine: &DeltaEngine,
    ) -> Result<TaskDone> {
        let record = &state.record;
        executor.copy_chunk(record, range, state.chunk_size)?;

        let slot = &state.landed[range.index as usize];
        // A retried chunk must not count down twice.
        let last = if slot.swap(true, Ordering::AcqRel) {
            state.remaining.load(Ordering::Acquire) == 0
        } else {
            state.remaining.fetch_sub(1, Ordering::AcqRel) == 1
        };
        let file = if last {
            let hash = executor.finish_chunked(record)?;
            Some(self.finish_file(state, executor, engine, hash, FileOutcome::Copied)?)
        } else {
            None
        };
        Ok(TaskDone {
            transferred: range.len,
            skipped: 0,
            file,
        })
    }

    /// Metadata, checkpoint removal and optional signatures for a file
    /// whose content is final.
    fn finish_file(
        &self,
        state: &FileState,
        executor: &CopyExecutor<'_, S, D>,
        engine: &DeltaEngine,
        hash: StrongHash,
        outcome: FileOutcome,
    ) -> Result<FileDone> {
        let record = &state.record;
        executor.apply_metadata(record)?;
        if let Some(store) = &self.checkpoints {
            store.remove(&self.transfer_id, &record.path)?;
        }
        let signature = if self.config.store_signatures {
            match executor.dest_signature(&record.path, engine) {
                Ok(table) => Some(table),
                Err(e) => {
                    warn!(path = %record.path, error = %e, "cannot record signatures");
                    None
                }
            }
        } else {
            None
        };
        debug!(path = %record.path, hash = %hash, "file complete");
        Ok(FileDone {
            outcome,
            hash,
            signature,
        })
    }

    /// Record a file's final state. Called only from the collecting thread.
    fn settle(
        &self,
        id: usize,
        state: &FileState,
        done: Result<FileDone>,
        progress: &ProgressTracker,
        outcomes: &mut [Option<FileOutcome>],
        entries: &mut Vec<ManifestEntry>,
    ) {
        let path = &state.record.path;
        let outcome = match done {
            Ok(file) => {
                let mut entry = ManifestEntry::new(&state.record, file.hash);
                if let Some(table) = file.signature {
                    entry = entry.with_signature(table);
                }
                entries.push(entry);
                file.outcome
            }
            Err(e) => {
                error!(path = %path, error = %e, "file failed");
                FileOutcome::Failed { error: e.to_string() }
            }
        };
        progress.finish_file(path, &outcome);
        outcomes[id] = Some(outcome);
    }
}

/// Scan `source` and sync it into `dest` on the local filesystem.
///
/// # Errors
///
/// As [`SyncEngine::new`] and [`SyncEngine::run`], plus invalid scan globs.
pub fn sync_dirs(source: impl Into<PathBuf>, dest: impl Into<PathBuf>, config: SyncConfig) -> Result<JobReport> {
    let source = source.into();
    let scanner = Scanner::new(&source, config.scan.clone())?;
    let engine = SyncEngine::new(LocalTransport::new(&source), LocalTransport::new(dest), config)?;
    engine.run(scanner.iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncBuilder;

    fn write(root: &std::path::Path, name: &str, data: &[u8]) {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn copies_tree_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src, "a.txt", b"alpha");
        write(&src, "nested/b.bin", &pattern(10_000, 1));
        write(&src, "empty", b"");

        let config = SyncBuilder::new().threads(2).build().unwrap();
        let report = sync_dirs(&src, &dst, config).unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.files.len(), 3);
        assert_eq!(report.progress.bytes_transferred, 10_005);
        assert_eq!(std::fs::read(dst.join("nested/b.bin")).unwrap(), pattern(10_000, 1));
        assert_eq!(std::fs::read(dst.join("empty")).unwrap(), b"");
    }

    #[test]
    fn chunked_files_reassemble() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let data = pattern(100_000, 2);
        write(&src, "big", &data);

        let config = SyncBuilder::new()
            .threads(4)
            .chunk_threshold(10_000)
            .chunk_size(7_000)
            .build()
            .unwrap();
        let report = sync_dirs(&src, &dst, config).unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(std::fs::read(dst.join("big")).unwrap(), data);
        assert_eq!(report.progress.bytes_transferred, 100_000);
    }

    #[test]
    fn unwritable_destination_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let engine = SyncEngine::new(
            LocalTransport::new(dir.path()),
            LocalTransport::new(blocker.join("sub")),
            SyncConfig::default(),
        )
        .unwrap();
        let err = engine.run(std::iter::empty()).unwrap_err();
        assert!(matches!(err, SyncError::DestinationUnwritable { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn scan_errors_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(
            LocalTransport::new(dir.path().join("s")),
            LocalTransport::new(dir.path().join("d")),
            SyncConfig::default(),
        )
        .unwrap();
        let report = engine
            .run(vec![Err(SyncError::scan("locked", "permission denied"))])
            .unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.scan_errors.len(), 1);
    }

    #[test]
    fn missing_source_file_fails_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write(&src, "ok", b"fine");
        let ghost = FileRecord {
            path: RelPath::from("ghost"),
            size: 10,
            mtime: crate::record::Mtime::from_secs(0),
            permissions: 0o644,
            sparse: false,
        };
        let ok = FileRecord::from_metadata(RelPath::from("ok"), &std::fs::metadata(src.join("ok")).unwrap());
        let config = SyncBuilder::new()
            .retries(1, std::time::Duration::from_millis(1), std::time::Duration::from_millis(2))
            .build()
            .unwrap();
        let engine = SyncEngine::new(LocalTransport::new(&src), LocalTransport::new(dir.path().join("dst")), config)
            .unwrap();
        let report = engine.run(vec![Ok(ghost), Ok(ok)]).unwrap();
        assert_eq!(report.status, JobStatus::CompletedWithFailures);
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.progress.files_transferred, 1);
        assert!(report.progress.bytes_transferred + report.progress.bytes_skipped <= report.progress.total_bytes);
    }

    #[test]
    fn dry_run_plans_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src, "a", b"alpha");
        write(&src, "nested/b", &pattern(5_000, 3));
        let manifest = dir.path().join("manifest.json");

        let config = SyncBuilder::new().dry_run(true).manifest(&manifest).build().unwrap();
        let report = sync_dirs(&src, &dst, config).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.files.len(), 2);
        assert!(report.files.iter().all(|f| f.action == "full" && f.outcome.is_none()));
        assert_eq!(report.progress.bytes_transferred, 0);
        assert!(!dst.exists());
        assert!(!manifest.exists());
    }

    #[test]
    fn delete_extra_removes_orphans_after_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src, "keep", b"keep");
        write(&dst, "gone", b"stale");
        write(&dst, "nested/also-gone", b"stale");

        let dry = SyncBuilder::new().delete_extra(true).dry_run(true).build().unwrap();
        let report = sync_dirs(&src, &dst, dry).unwrap();
        assert_eq!(report.deleted, vec![RelPath::from("gone"), RelPath::from("nested/also-gone")]);
        assert!(dst.join("gone").exists());

        let plain = sync_dirs(&src, &dst, SyncConfig::default()).unwrap();
        assert!(plain.deleted.is_empty());
        assert!(dst.join("gone").exists());

        let config = SyncBuilder::new().delete_extra(true).build().unwrap();
        let report = sync_dirs(&src, &dst, config).unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.deleted.len(), 2);
        assert!(!dst.join("gone").exists());
        assert!(!dst.join("nested/also-gone").exists());
        assert_eq!(std::fs::read(dst.join("keep")).unwrap(), b"keep");
    }

    #[test]
    fn scan_errors_suppress_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src, "ok", b"fine");
        write(&dst, "maybe-unreadable", b"keep me");
        let ok = FileRecord::from_metadata(RelPath::from("ok"), &std::fs::metadata(src.join("ok")).unwrap());

        let config = SyncBuilder::new().delete_extra(true).build().unwrap();
        let engine = SyncEngine::new(LocalTransport::new(&src), LocalTransport::new(&dst), config).unwrap();
        let report = engine
            .run(vec![Ok(ok), Err(SyncError::scan("maybe-unreadable", "permission denied"))])
            .unwrap();
        assert!(report.deleted.is_empty());
        assert!(dst.join("maybe-unreadable").exists());
    }

    #[test]
    fn report_serializes() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("src"), "a", b"abc");
        let report = sync_dirs(dir.path().join("src"), dir.path().join("dst"), SyncConfig::default()).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["files"][0]["outcome"]["status"], "copied");
    }
}
