//! Integration tests for chunksync.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{NaiveTime, Weekday};
use proptest::prelude::*;

use chunksync::{
    sync_dirs, CancelToken, CheckpointStore, FileOutcome, FileStat, JobStatus, LocalTransport, ProgressSnapshot,
    RateLimit, ReadHandle, RelPath, Scanner, Schedule, StrongHash, SyncBuilder, SyncConfig, SyncEngine, TokenBucket,
    Transport,
};

const MIB: u64 = 1024 * 1024;

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn write_file(root: &Path, name: &str, data: &[u8]) {
    let path = root.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

struct Dirs {
    _tmp: tempfile::TempDir,
    src: PathBuf,
    dst: PathBuf,
    state: PathBuf,
}

fn dirs() -> Dirs {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let dst = tmp.path().join("dst");
    let state = tmp.path().join("state");
    std::fs::create_dir_all(&src).unwrap();
    Dirs {
        _tmp: tmp,
        src,
        dst,
        state,
    }
}

fn run_engine<S: Transport>(source: S, d: &Dirs, config: SyncConfig, cancel: Option<CancelToken>) -> chunksync::JobReport {
    let scanner = Scanner::new(&d.src, config.scan.clone()).unwrap();
    let mut engine = SyncEngine::new(source, LocalTransport::new(&d.dst), config).unwrap();
    if let Some(token) = cancel {
        engine = engine.with_cancel(token);
    }
    engine.run(scanner.iter()).unwrap()
}

// =============================================================================
// SOURCE WRAPPERS
// =============================================================================

/// Source whose reads of one file fail a fixed number of times.
struct Flaky {
    inner: LocalTransport,
    target: RelPath,
    failures: AtomicU32,
}

impl Flaky {
    fn new(root: &Path, target: &str, failures: u32) -> Self {
        Self {
            inner: LocalTransport::new(root),
            target: RelPath::from(target),
            failures: AtomicU32::new(failures),
        }
    }
}

impl Transport for Flaky {
    type Reader = <LocalTransport as Transport>::Reader;
    type Writer = <LocalTransport as Transport>::Writer;

    fn open_for_read(&self, path: &RelPath) -> io::Result<Self::Reader> {
        if *path == self.target {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "transient"));
            }
        }
        self.inner.open_for_read(path)
    }
    fn open_for_write(&self, path: &RelPath) -> io::Result<Self::Writer> {
        self.inner.open_for_write(path)
    }
    fn stat(&self, path: &RelPath) -> io::Result<Option<FileStat>> {
        self.inner.stat(path)
    }
    fn rename(&self, from: &RelPath, to: &RelPath) -> io::Result<()> {
        self.inner.rename(from, to)
    }
    fn remove(&self, path: &RelPath) -> io::Result<()> {
        self.inner.remove(path)
    }
    fn describe(&self, path: &RelPath) -> PathBuf {
        self.inner.describe(path)
    }
}

/// Source that cancels the job after a number of reads, simulating an
/// interruption at an arbitrary point.
struct Interrupting {
    inner: LocalTransport,
    cancel: CancelToken,
    reads_left: Arc<AtomicUsize>,
}

struct InterruptingReader {
    inner: <LocalTransport as Transport>::Reader,
    cancel: CancelToken,
    reads_left: Arc<AtomicUsize>,
}

impl ReadHandle for InterruptingReader {
    fn read_range(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read_range(offset, buf)?;
        if self.reads_left.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cancel.cancel();
        }
        Ok(n)
    }
}

impl Transport for Interrupting {
    type Reader = InterruptingReader;
    type Writer = <LocalTransport as Transport>::Writer;

    fn open_for_read(&self, path: &RelPath) -> io::Result<InterruptingReader> {
        Ok(InterruptingReader {
            inner: self.inner.open_for_read(path)?,
            cancel: self.cancel.clone(),
            reads_left: Arc::clone(&self.reads_left),
        })
    }
    fn open_for_write(&self, path: &RelPath) -> io::Result<Self::Writer> {
        self.inner.open_for_write(path)
    }
    fn stat(&self, path: &RelPath) -> io::Result<Option<FileStat>> {
        self.inner.stat(path)
    }
    fn rename(&self, from: &RelPath, to: &RelPath) -> io::Result<()> {
        self.inner.rename(from, to)
    }
    fn remove(&self, path: &RelPath) -> io::Result<()> {
        self.inner.remove(path)
    }
    fn describe(&self, path: &RelPath) -> PathBuf {
        self.inner.describe(path)
    }
}

/// Destination that refuses writes to objects whose recorded mode lacks the
/// owner-write bit, independent of the privileges the tests run with.
struct ModeEnforcing {
    inner: LocalTransport,
    read_only: Mutex<HashSet<RelPath>>,
    unlocked: Arc<AtomicU32>,
}

impl Transport for ModeEnforcing {
    type Reader = <LocalTransport as Transport>::Reader;
    type Writer = <LocalTransport as Transport>::Writer;

    fn open_for_read(&self, path: &RelPath) -> io::Result<Self::Reader> {
        self.inner.open_for_read(path)
    }
    fn open_for_write(&self, path: &RelPath) -> io::Result<Self::Writer> {
        if self.read_only.lock().unwrap().contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
        }
        self.inner.open_for_write(path)
    }
    fn stat(&self, path: &RelPath) -> io::Result<Option<FileStat>> {
        self.inner.stat(path)
    }
    fn rename(&self, from: &RelPath, to: &RelPath) -> io::Result<()> {
        self.inner.rename(from, to)
    }
    fn remove(&self, path: &RelPath) -> io::Result<()> {
        self.inner.remove(path)
    }
    fn set_permissions(&self, path: &RelPath, mode: u32) -> io::Result<()> {
        {
            let mut read_only = self.read_only.lock().unwrap();
            if mode & 0o200 == 0 {
                read_only.insert(path.clone());
            } else {
                read_only.remove(path);
            }
        }
        self.inner.set_permissions(path, mode)
    }
    fn make_writable(&self, path: &RelPath) -> io::Result<bool> {
        let was_locked = self.read_only.lock().unwrap().remove(path);
        if was_locked {
            self.unlocked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.inner.make_writable(path)? || was_locked)
    }
    fn set_mtime(&self, path: &RelPath, mtime: chunksync::Mtime) -> io::Result<()> {
        self.inner.set_mtime(path, mtime)
    }
    fn prepare(&self) -> io::Result<()> {
        self.inner.prepare()
    }
    fn describe(&self, path: &RelPath) -> PathBuf {
        self.inner.describe(path)
    }
}

// =============================================================================
// COPY
// =============================================================================

#[test]
fn tree_copy_round_trip() {
    let d = dirs();
    write_file(&d.src, "a.txt", b"hello");
    write_file(&d.src, "dir/b.bin", &pseudo_random(70_000, 1));
    write_file(&d.src, "dir/deeper/c.bin", &pseudo_random(3, 2));
    write_file(&d.src, "zero", b"");

    let report = sync_dirs(&d.src, &d.dst, SyncBuilder::new().threads(3).build().unwrap()).unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    for name in ["a.txt", "dir/b.bin", "dir/deeper/c.bin", "zero"] {
        assert_eq!(
            std::fs::read(d.src.join(name)).unwrap(),
            std::fs::read(d.dst.join(name)).unwrap(),
            "{name}"
        );
    }
    assert!((report.progress.percent() - 100.0).abs() < f64::EPSILON);
}

#[test]
fn progress_never_exceeds_totals() {
    let d = dirs();
    for i in 0..12 {
        write_file(&d.src, &format!("f{i}"), &pseudo_random(5_000 + i * 997, i as u64));
    }
    write_file(&d.src, "big", &pseudo_random(200_000, 99));

    let snapshots: Arc<Mutex<Vec<ProgressSnapshot>>> = Arc::default();
    let sink = Arc::clone(&snapshots);
    let config = SyncBuilder::new()
        .threads(4)
        .chunk_threshold(50_000)
        .chunk_size(16_384)
        .build()
        .unwrap();
    let scanner = Scanner::new(&d.src, config.scan.clone()).unwrap();
    let engine = SyncEngine::new(LocalTransport::new(&d.src), LocalTransport::new(&d.dst), config)
        .unwrap()
        .with_observer(Arc::new(move |_: &RelPath, _: &FileOutcome, snapshot: &ProgressSnapshot| {
            sink.lock().unwrap().push(snapshot.clone());
        }));
    let report = engine.run(scanner.iter()).unwrap();

    let snapshots = snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 13);
    for s in snapshots.iter() {
        assert!(s.bytes_transferred + s.bytes_skipped <= s.total_bytes);
        assert!(s.files_transferred + s.files_skipped + s.files_failed <= s.total_files);
    }
    assert_eq!(report.progress.bytes_transferred, report.progress.total_bytes);
    assert_eq!(report.progress.eta_secs, Some(0.0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn chunked_copy_matches_sequential(len in 1usize..60_000, chunk in 512u64..20_000, seed in any::<u64>()) {
        let d = dirs();
        let data = pseudo_random(len, seed);
        write_file(&d.src, "f", &data);

        let chunked = SyncBuilder::new().threads(4).chunk_threshold(1).chunk_size(chunk).build().unwrap();
        let report = sync_dirs(&d.src, &d.dst, chunked).unwrap();
        prop_assert_eq!(report.status, JobStatus::Completed);

        let sequential_dst = d.state.join("seq");
        let report = sync_dirs(&d.src, &sequential_dst, SyncConfig::default()).unwrap();
        prop_assert_eq!(report.status, JobStatus::Completed);

        let a = std::fs::read(d.dst.join("f")).unwrap();
        let b = std::fs::read(sequential_dst.join("f")).unwrap();
        prop_assert_eq!(StrongHash::compute(&a), StrongHash::compute(&b));
        prop_assert_eq!(a, data);
    }
}

// =============================================================================
// INCREMENTAL AND DELTA
// =============================================================================

#[test]
fn unchanged_tree_is_skipped() {
    let d = dirs();
    write_file(&d.src, "a", &pseudo_random(10_000, 3));
    write_file(&d.src, "b/c", &pseudo_random(20_000, 4));
    let config = SyncBuilder::new().manifest(d.state.join("manifest.json")).build().unwrap();

    let first = sync_dirs(&d.src, &d.dst, config.clone()).unwrap();
    assert_eq!(first.progress.bytes_transferred, 30_000);

    let second = sync_dirs(&d.src, &d.dst, config).unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.progress.bytes_transferred, 0);
    assert_eq!(second.progress.files_skipped, 2);
    assert!((second.progress.percent() - 100.0).abs() < f64::EPSILON);
    assert!(second.files.iter().all(|f| f.outcome == Some(FileOutcome::Skipped)));
}

#[test]
fn modified_region_moves_about_its_size() {
    let d = dirs();
    let original = pseudo_random(4 * MIB as usize, 5);
    write_file(&d.src, "data.bin", &original);
    let config = SyncBuilder::new()
        .manifest(d.state.join("manifest.bin"))
        .delta_block_size(4096)
        .build()
        .unwrap();
    sync_dirs(&d.src, &d.dst, config.clone()).unwrap();

    let mut modified = original;
    let patch = pseudo_random(10_000, 6);
    modified[2_000_000..2_010_000].copy_from_slice(&patch);
    // Move the mtime so the planner sees a change.
    std::thread::sleep(Duration::from_millis(20));
    write_file(&d.src, "data.bin", &modified);

    let report = sync_dirs(&d.src, &d.dst, config).unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.files[0].outcome, Some(FileOutcome::Delta));
    // 10 000 changed bytes touch at most four 4 KiB blocks.
    assert!(report.progress.bytes_transferred <= 4 * 4096, "{}", report.progress.bytes_transferred);
    assert!(report.progress.bytes_transferred >= 10_000);
    assert_eq!(std::fs::read(d.dst.join("data.bin")).unwrap(), modified);
}

#[test]
fn deleted_destination_falls_back_to_full_copy() {
    let d = dirs();
    write_file(&d.src, "x", &pseudo_random(8_000, 7));
    let config = SyncBuilder::new().manifest(d.state.join("m.json")).build().unwrap();
    sync_dirs(&d.src, &d.dst, config.clone()).unwrap();
    std::fs::remove_file(d.dst.join("x")).unwrap();

    let report = sync_dirs(&d.src, &d.dst, config).unwrap();
    assert_eq!(report.files[0].action, "full");
    assert_eq!(report.progress.bytes_transferred, 8_000);
    assert_eq!(std::fs::read(d.dst.join("x")).unwrap(), pseudo_random(8_000, 7));
}

// =============================================================================
// RETRY
// =============================================================================

fn retry_config(max_retries: u32) -> SyncConfig {
    SyncBuilder::new()
        .threads(2)
        .retries(max_retries, Duration::from_millis(1), Duration::from_millis(5))
        .build()
        .unwrap()
}

#[test]
fn transient_failures_are_retried() {
    let d = dirs();
    write_file(&d.src, "flaky", &pseudo_random(9_000, 8));
    write_file(&d.src, "steady", &pseudo_random(1_000, 9));
    let source = Flaky::new(&d.src, "flaky", 2);

    let report = run_engine(source, &d, retry_config(3), None);
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.progress.files_transferred, 2);
    assert_eq!(report.progress.files_failed, 0);
    assert_eq!(report.progress.bytes_transferred, 10_000);
    assert_eq!(std::fs::read(d.dst.join("flaky")).unwrap(), pseudo_random(9_000, 8));
}

#[test]
fn exhausted_retries_fail_one_file() {
    let d = dirs();
    write_file(&d.src, "flaky", &pseudo_random(9_000, 8));
    write_file(&d.src, "steady", &pseudo_random(1_000, 9));
    let source = Flaky::new(&d.src, "flaky", 100);

    let report = run_engine(source, &d, retry_config(2), None);
    assert_eq!(report.status, JobStatus::CompletedWithFailures);
    assert_eq!(report.progress.files_failed, 1);
    assert_eq!(report.progress.files_transferred, 1);
    let failed: Vec<_> = report.failures().map(|f| f.path.to_string()).collect();
    assert_eq!(failed, vec!["flaky".to_string()]);
    assert_eq!(std::fs::read(d.dst.join("steady")).unwrap(), pseudo_random(1_000, 9));
}

// =============================================================================
// RESUME
// =============================================================================

fn resume_config(d: &Dirs, chunked: bool) -> SyncConfig {
    let builder = SyncBuilder::new()
        .threads(1)
        .buffer_size(4096)
        .checkpoints(d.state.join("checkpoints"), 4096);
    let builder = if chunked {
        builder.chunk_threshold(1).chunk_size(8192)
    } else {
        builder
    };
    builder.build().unwrap()
}

#[test]
fn interrupted_sequential_copy_resumes() {
    let d = dirs();
    let data = pseudo_random(64 * 1024, 10);
    write_file(&d.src, "seq", &data);

    let cancel = CancelToken::new();
    let source = Interrupting {
        inner: LocalTransport::new(&d.src),
        cancel: cancel.clone(),
        reads_left: Arc::new(AtomicUsize::new(5)),
    };
    let first = run_engine(source, &d, resume_config(&d, false), Some(cancel));
    assert_eq!(first.status, JobStatus::Cancelled);
    assert!(first.files[0].outcome.is_none());

    let second = run_engine(LocalTransport::new(&d.src), &d, resume_config(&d, false), None);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.progress.bytes_skipped, 5 * 4096);
    assert_eq!(second.progress.bytes_transferred, 64 * 1024 - 5 * 4096);
    assert_eq!(std::fs::read(d.dst.join("seq")).unwrap(), data);

    let store = CheckpointStore::open(d.state.join("checkpoints")).unwrap();
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn interrupted_chunked_copy_resumes() {
    let d = dirs();
    let data = pseudo_random(64 * 1024, 11);
    write_file(&d.src, "chunked", &data);

    let cancel = CancelToken::new();
    let source = Interrupting {
        inner: LocalTransport::new(&d.src),
        cancel: cancel.clone(),
        // Two reads per chunk: three chunks land before the job stops.
        reads_left: Arc::new(AtomicUsize::new(6)),
    };
    let first = run_engine(source, &d, resume_config(&d, true), Some(cancel));
    assert_eq!(first.status, JobStatus::Cancelled);

    let second = run_engine(LocalTransport::new(&d.src), &d, resume_config(&d, true), None);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.progress.bytes_skipped, 3 * 8192);
    assert_eq!(second.progress.bytes_transferred, 64 * 1024 - 3 * 8192);
    assert_eq!(std::fs::read(d.dst.join("chunked")).unwrap(), data);
}

#[test]
fn tampered_destination_restarts_from_zero() {
    let d = dirs();
    let data = pseudo_random(64 * 1024, 12);
    write_file(&d.src, "seq", &data);

    let cancel = CancelToken::new();
    let source = Interrupting {
        inner: LocalTransport::new(&d.src),
        cancel: cancel.clone(),
        reads_left: Arc::new(AtomicUsize::new(4)),
    };
    run_engine(source, &d, resume_config(&d, false), Some(cancel));

    let mut partial = std::fs::read(d.dst.join("seq")).unwrap();
    partial[100] ^= 0xFF;
    std::fs::write(d.dst.join("seq"), &partial).unwrap();

    let second = run_engine(LocalTransport::new(&d.src), &d, resume_config(&d, false), None);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.progress.bytes_skipped, 0);
    assert_eq!(second.progress.bytes_transferred, 64 * 1024);
    assert_eq!(std::fs::read(d.dst.join("seq")).unwrap(), data);
}

// =============================================================================
// THROTTLE AND SCHEDULE
// =============================================================================

#[test]
fn throttled_copy_converges_to_limit() {
    let d = dirs();
    let rate = 400_000u64;
    write_file(&d.src, "slow", &pseudo_random(1_200_000, 13));
    let config = SyncBuilder::new().threads(2).bandwidth_limit(rate).build().unwrap();

    let start = Instant::now();
    let report = sync_dirs(&d.src, &d.dst, config).unwrap();
    let elapsed = start.elapsed().as_secs_f64();
    assert_eq!(report.status, JobStatus::Completed);
    // One bucketful is free; the remaining 800 KB take about two seconds.
    assert!(elapsed >= 1.8, "finished in {elapsed}s");
    assert!(elapsed < 10.0, "finished in {elapsed}s");
}

#[test]
fn shared_bucket_bounds_parallel_consumers() {
    let bucket = Arc::new(TokenBucket::new(200_000));
    let start = Instant::now();
    std::thread::scope(|s| {
        for _ in 0..4 {
            let bucket = Arc::clone(&bucket);
            s.spawn(move || {
                for _ in 0..10 {
                    bucket.acquire(10_000);
                }
            });
        }
    });
    // 400 KB against 200 KB/s with a 200 KB head start.
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[test]
fn schedule_picks_business_hours_and_default() {
    let schedule = Schedule::from_json(
        r#"{
            "rules": [
                { "name": "Business", "days": ["mon","tue","wed","thu","fri"],
                  "start_time": "09:00", "end_time": "18:00", "limit_bytes_per_sec": "100M" }
            ],
            "default_limit": "200M",
            "enabled": true
        }"#,
    )
    .unwrap();
    let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
    assert_eq!(schedule.resolve(Weekday::Mon, at(9, 0)), 100 * MIB);
    assert_eq!(schedule.resolve(Weekday::Sun, at(7, 0)), 200 * MIB);
    assert_eq!(schedule.resolve(Weekday::Fri, at(18, 0)), 200 * MIB);
}

#[test]
fn invalid_schedule_stops_job_setup() {
    let d = dirs();
    std::fs::create_dir_all(&d.state).unwrap();
    let path = d.state.join("schedule.json");
    std::fs::write(&path, r#"{"rules": [{"name": "x", "start_time": "25:00", "end_time": "01:00", "limit_bytes_per_sec": 1}], "default_limit": 0}"#).unwrap();
    let config = SyncBuilder::new().schedule(&path).build().unwrap();
    let err = SyncEngine::new(LocalTransport::new(&d.src), LocalTransport::new(&d.dst), config)
        .err()
        .unwrap();
    assert!(matches!(err, chunksync::SyncError::ScheduleConfig(_)));
}

// =============================================================================
// METADATA
// =============================================================================

#[cfg(unix)]
#[test]
fn read_only_destination_is_rewritten() {
    use std::os::unix::fs::PermissionsExt;

    let d = dirs();
    let set_mode = |path: &Path, mode: u32| std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    let mode_of = |path: &Path| std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
    write_file(&d.src, "small", &pseudo_random(3_000, 20));
    write_file(&d.src, "big", &pseudo_random(40_000, 21));
    set_mode(&d.src.join("small"), 0o444);
    set_mode(&d.src.join("big"), 0o444);

    let config = SyncBuilder::new()
        .threads(2)
        .delta(false)
        .chunk_threshold(20_000)
        .chunk_size(8_192)
        .retries(2, Duration::from_millis(1), Duration::from_millis(5))
        .build()
        .unwrap();
    let scanner = Scanner::new(&d.src, config.scan.clone()).unwrap();
    let unlocked = Arc::new(AtomicU32::new(0));
    let dest = ModeEnforcing {
        inner: LocalTransport::new(&d.dst),
        read_only: Mutex::default(),
        unlocked: Arc::clone(&unlocked),
    };
    let engine = SyncEngine::new(LocalTransport::new(&d.src), dest, config).unwrap();

    let first = engine.run(scanner.iter()).unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(mode_of(&d.dst.join("small")), 0o444);
    assert_eq!(mode_of(&d.dst.join("big")), 0o444);

    for (name, len, seed) in [("small", 3_100, 22), ("big", 41_000, 23)] {
        let path = d.src.join(name);
        set_mode(&path, 0o644);
        std::fs::write(&path, pseudo_random(len, seed)).unwrap();
        set_mode(&path, 0o444);
    }

    let second = engine.run(scanner.iter()).unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.progress.files_failed, 0);
    assert_eq!(std::fs::read(d.dst.join("small")).unwrap(), pseudo_random(3_100, 22));
    assert_eq!(std::fs::read(d.dst.join("big")).unwrap(), pseudo_random(41_000, 23));
    assert_eq!(mode_of(&d.dst.join("small")), 0o444);
    assert_eq!(mode_of(&d.dst.join("big")), 0o444);
    assert_eq!(unlocked.load(Ordering::SeqCst), 2);
}

#[test]
fn modification_times_follow_the_source() {
    let d = dirs();
    write_file(&d.src, "dated", b"from 2020");
    let when = filetime::FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(d.src.join("dated"), when).unwrap();
    let mtime_of = |path: PathBuf| filetime::FileTime::from_last_modification_time(&std::fs::metadata(path).unwrap());

    sync_dirs(&d.src, &d.dst, SyncConfig::default()).unwrap();
    assert_eq!(mtime_of(d.dst.join("dated")), when);

    let untouched = d.state.join("untouched");
    let config = SyncBuilder::new().preserve_times(false).build().unwrap();
    sync_dirs(&d.src, &untouched, config).unwrap();
    assert_ne!(mtime_of(untouched.join("dated")), when);
}
