//! Durable in-progress transfer state.
//!
//! One pretty-printed JSON file per (transfer id, path). Writes for the same
//! key are serialized and merged with what is already on disk, so the
//! confirmed offset only grows and completed chunks are only added. A file
//! that fails to decode is treated as absent.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunk::ChunkRange;
use crate::error::{Result, SyncError};
use crate::record::RelPath;
use crate::transport::Transport;
use crate::verify::Verifier;

/// Stable id for a (source root, destination root) pair.
///
/// Re-running the same job yields the same id, which is how checkpoints are
/// matched on restart.
#[must_use]
pub fn transfer_id(source: &Path, dest: &Path) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_os_str().as_encoded_bytes());
    hasher.update(&[0]);
    hasher.update(dest.as_os_str().as_encoded_bytes());
    let id = hasher.finalize().to_hex();
    id[..16].to_string()
}

/// Confirmed progress of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Job the checkpoint belongs to.
    pub transfer_id: String,
    /// File path relative to the roots.
    pub path: RelPath,
    /// Source size when the transfer started.
    pub size: u64,
    /// Chunk length, or 0 for a sequential transfer.
    pub chunk_size: u64,
    /// Bytes durably written from offset 0 (sequential transfers).
    pub confirmed_offset: u64,
    /// Chunks durably written (chunked transfers).
    pub completed_chunks: BTreeSet<u32>,
    /// Unix seconds of the last update.
    pub updated_at: i64,
}

impl Checkpoint {
    /// Empty checkpoint for a transfer starting now.
    #[must_use]
    pub fn new(transfer_id: impl Into<String>, path: RelPath, size: u64, chunk_size: u64) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            path,
            size,
            chunk_size,
            confirmed_offset: 0,
            completed_chunks: BTreeSet::new(),
            updated_at: Utc::now().timestamp(),
        }
    }

    /// Whether the transfer is chunked.
    #[must_use]
    pub const fn is_chunked(&self) -> bool {
        self.chunk_size > 0
    }

    /// Copy with the offset advanced to `offset`.
    #[must_use]
    pub fn at_offset(&self, offset: u64) -> Self {
        Self {
            confirmed_offset: offset.min(self.size),
            updated_at: Utc::now().timestamp(),
            ..self.clone()
        }
    }

    /// Copy with chunk `index` marked complete.
    #[must_use]
    pub fn with_chunk(&self, index: u32) -> Self {
        let mut next = self.clone();
        next.completed_chunks.insert(index);
        next.updated_at = Utc::now().timestamp();
        next
    }

    /// Fold `other` into `self`, keeping the furthest progress of each.
    fn merge(&mut self, other: &Self) {
        self.confirmed_offset = self.confirmed_offset.max(other.confirmed_offset).min(self.size);
        self.completed_chunks.extend(other.completed_chunks.iter().copied());
        self.updated_at = self.updated_at.max(other.updated_at);
    }

    /// Whether this checkpoint describes the same transfer shape.
    #[must_use]
    pub fn matches(&self, transfer_id: &str, path: &RelPath, size: u64, chunk_size: u64) -> bool {
        self.transfer_id == transfer_id && self.path == *path && self.size == size && self.chunk_size == chunk_size
    }

    /// Re-verify the recorded progress against both transports.
    ///
    /// Any difference, including a destination shorter than the confirmed
    /// region, restarts the file from zero.
    ///
    /// # Errors
    ///
    /// Transport failures while hashing.
    pub fn verify<S: Transport, D: Transport>(
        &self,
        verifier: &Verifier,
        source: &S,
        dest: &D,
        ranges: &[ChunkRange],
    ) -> Result<ResumePoint> {
        let dest_size = dest
            .stat(&self.path)
            .map_err(|e| SyncError::transport(dest.describe(&self.path), e))?
            .map_or(0, |s| s.size);

        if self.is_chunked() {
            if self.completed_chunks.is_empty() {
                return Ok(ResumePoint::Fresh);
            }
            for index in &self.completed_chunks {
                let Some(range) = ranges.iter().find(|r| r.index == *index) else {
                    return Ok(ResumePoint::Fresh);
                };
                if dest_size < range.end()
                    || !verifier.range_matches(source, dest, &self.path, range.offset, range.len)?
                {
                    warn!(path = %self.path, chunk = index, "checkpointed chunk differs, restarting file");
                    return Ok(ResumePoint::Fresh);
                }
            }
            return Ok(ResumePoint::Chunks(self.completed_chunks.clone()));
        }

        if self.confirmed_offset == 0 {
            return Ok(ResumePoint::Fresh);
        }
        if dest_size < self.confirmed_offset
            || !verifier.range_matches(source, dest, &self.path, 0, self.confirmed_offset)?
        {
            warn!(path = %self.path, offset = self.confirmed_offset, "checkpointed prefix differs, restarting file");
            return Ok(ResumePoint::Fresh);
        }
        Ok(ResumePoint::Offset(self.confirmed_offset))
    }
}

/// Where a transfer picks up after verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Start from zero.
    Fresh,
    /// Sequential transfer continues at this offset.
    Offset(u64),
    /// These chunks are already in place.
    Chunks(BTreeSet<u32>),
}

impl ResumePoint {
    /// Bytes already satisfied by the destination.
    #[must_use]
    pub fn bytes_satisfied(&self, ranges: &[ChunkRange]) -> u64 {
        match self {
            Self::Fresh => 0,
            Self::Offset(offset) => *offset,
            Self::Chunks(done) => ranges.iter().filter(|r| done.contains(&r.index)).map(|r| r.len).sum(),
        }
    }
}

/// Directory of checkpoint files.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    locks: Mutex<FxHashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    /// Open (creating if needed) the checkpoint directory.
    ///
    /// # Errors
    ///
    /// I/O failure creating the directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::default(),
        })
    }

    /// Checkpoint directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, transfer_id: &str, path: &RelPath) -> PathBuf {
        let mut hasher = blake3::Hasher::new();
        hasher.update(transfer_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(path.as_bytes());
        let key = hasher.finalize().to_hex();
        self.dir.join(format!("{transfer_id}-{}.json", &key[..32]))
    }

    fn lock_for(&self, file: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(file.to_path_buf()).or_default())
    }

    fn read(file: &Path) -> Result<Option<Checkpoint>> {
        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::CheckpointCorrupt {
                path: file.to_path_buf(),
                message: e.to_string(),
            })
    }

    fn read_lenient(file: &Path) -> Option<Checkpoint> {
        match Self::read(file) {
            Ok(cp) => cp,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable checkpoint");
                None
            }
        }
    }

    /// Checkpoint for `path` in `transfer_id`, if one exists and decodes.
    #[must_use]
    pub fn load(&self, transfer_id: &str, path: &RelPath) -> Option<Checkpoint> {
        let file = self.file_for(transfer_id, path);
        let lock = self.lock_for(&file);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        Self::read_lenient(&file).filter(|cp| cp.transfer_id == transfer_id && cp.path == *path)
    }

    /// Persist `checkpoint`, merged with the stored one for the same key.
    /// Returns the state now on disk.
    ///
    /// A stored checkpoint for a different file size or chunk size is
    /// replaced rather than merged.
    ///
    /// # Errors
    ///
    /// I/O or encoding failure.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<Checkpoint> {
        let file = self.file_for(&checkpoint.transfer_id, &checkpoint.path);
        let lock = self.lock_for(&file);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut merged = checkpoint.clone();
        if let Some(stored) = Self::read_lenient(&file) {
            if stored.matches(&checkpoint.transfer_id, &checkpoint.path, checkpoint.size, checkpoint.chunk_size) {
                merged.merge(&stored);
            }
        }
        let bytes = serde_json::to_vec_pretty(&merged).map_err(std::io::Error::other)?;
        let tmp = file.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &file)?;
        debug!(
            path = %merged.path,
            offset = merged.confirmed_offset,
            chunks = merged.completed_chunks.len(),
            "checkpoint saved"
        );
        Ok(merged)
    }

    /// Delete the checkpoint for `path`. Absence is not an error.
    ///
    /// # Errors
    ///
    /// I/O failure other than absence.
    pub fn remove(&self, transfer_id: &str, path: &RelPath) -> Result<()> {
        let file = self.file_for(transfer_id, path);
        let lock = self.lock_for(&file);
        {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).remove(&file);
        Ok(())
    }

    /// All checkpoint files with their decoded contents.
    ///
    /// # Errors
    ///
    /// I/O failure listing the directory.
    pub fn list(&self) -> Result<Vec<(PathBuf, Result<Checkpoint>)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let decoded = Self::read(&path).and_then(|cp| {
                    cp.ok_or_else(|| SyncError::CheckpointCorrupt {
                        path: path.clone(),
                        message: "vanished while listing".into(),
                    })
                });
                out.push((path, decoded));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Remove checkpoints not updated within `max_age`. Undecodable files
    /// are aged by their filesystem modification time. Returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// I/O failure listing or deleting.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(max_age_secs);
        let mut removed = 0;
        for (file, decoded) in self.list()? {
            let updated_at = match decoded {
                Ok(cp) => cp.updated_at,
                Err(_) => std::fs::metadata(&file)
                    .and_then(|m| m.modified())
                    .map(|t| crate::record::Mtime::from_system_time(t).secs)
                    .unwrap_or(i64::MIN),
            };
            if updated_at < cutoff {
                match std::fs::remove_file(&file) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "stale checkpoints removed");
        }
        Ok(removed)
    }
}
