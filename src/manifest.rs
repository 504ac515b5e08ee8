//! Durable record of prior sync results.
//!
//! Keyed by relative path. Entries are read by the planner and delta engine
//! and written once per file when a job finishes. The store tolerates
//! concurrent writers on disjoint keys; the whole map is persisted with a
//! temp-file rename at job end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::hash::StrongHash;
use crate::record::{FileRecord, Mtime, RelPath};
use crate::signature::SignatureTable;

/// Current on-disk manifest version.
pub const MANIFEST_VERSION: u32 = 1;

/// Prior sync state of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the sync roots.
    pub path: RelPath,
    /// Size at last sync.
    pub size: u64,
    /// Source modification time at last sync.
    pub mtime: Mtime,
    /// BLAKE3 hash of the content.
    pub hash: StrongHash,
    /// Block signatures of the content, when retained.
    #[serde(default)]
    pub signature: Option<SignatureTable>,
    /// Unix seconds when the entry was written.
    pub synced_at: i64,
}

impl ManifestEntry {
    /// Entry for a file that just finished syncing.
    #[must_use]
    pub fn new(record: &FileRecord, hash: StrongHash) -> Self {
        Self {
            path: record.path.clone(),
            size: record.size,
            mtime: record.mtime,
            hash,
            signature: None,
            synced_at: Utc::now().timestamp(),
        }
    }

    /// Attach a block signature table.
    #[must_use]
    pub fn with_signature(mut self, signature: SignatureTable) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Whether size and mtime still match the scanned record.
    #[must_use]
    pub fn matches_metadata(&self, record: &FileRecord) -> bool {
        self.size == record.size && self.mtime == record.mtime
    }
}

/// Encoding used for the manifest file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    /// Pretty JSON.
    Json,
    /// bincode.
    Binary,
}

impl ManifestFormat {
    /// `.bin` selects bincode; anything else is JSON.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("bin") => Self::Binary,
            _ => Self::Json,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    updated_at: i64,
    entries: Vec<ManifestEntry>,
}

type EntryMap = HashMap<RelPath, ManifestEntry, FxBuildHasher>;

/// Keyed manifest map, optionally backed by a file.
#[derive(Debug, Default)]
pub struct ManifestStore {
    path: Option<PathBuf>,
    entries: RwLock<EntryMap>,
}

impl ManifestStore {
    /// Store with no backing file.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the manifest at `path`. A missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Manifest`] if the file exists but cannot be read,
    /// cannot be decoded, or has an unsupported version.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no manifest yet");
                return Ok(Self {
                    path: Some(path),
                    entries: RwLock::default(),
                });
            }
            Err(e) => {
                return Err(SyncError::Manifest(format!("cannot read {}: {e}", path.display())));
            }
        };

        let file: ManifestFile = match ManifestFormat::from_path(&path) {
            ManifestFormat::Json => serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::Manifest(format!("cannot decode {}: {e}", path.display())))?,
            ManifestFormat::Binary => bincode::deserialize(&bytes)
                .map_err(|e| SyncError::Manifest(format!("cannot decode {}: {e}", path.display())))?,
        };
        if file.version != MANIFEST_VERSION {
            return Err(SyncError::Manifest(format!(
                "unsupported manifest version {} in {}",
                file.version,
                path.display()
            )));
        }

        let entries: EntryMap = file
            .entries
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        info!(path = %path.display(), entries = entries.len(), "manifest loaded");
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, path: &RelPath) -> Option<ManifestEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Insert or replace an entry.
    pub fn upsert(&self, entry: ManifestEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.path.clone(), entry);
    }

    /// Remove an entry.
    pub fn remove(&self, path: &RelPath) -> Option<ManifestEntry> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries sorted by path.
    #[must_use]
    pub fn entries(&self) -> Vec<ManifestEntry> {
        let mut entries: Vec<ManifestEntry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// Persist to the backing file via temp file and rename. No-op when
    /// in memory.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Manifest`] when encoding or writing fails.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            updated_at: Utc::now().timestamp(),
            entries: self.entries(),
        };
        let bytes = match ManifestFormat::from_path(path) {
            ManifestFormat::Json => serde_json::to_vec_pretty(&file)
                .map_err(|e| SyncError::Manifest(format!("cannot encode manifest: {e}")))?,
            ManifestFormat::Binary => bincode::serialize(&file)
                .map_err(|e| SyncError::Manifest(format!("cannot encode manifest: {e}")))?,
        };

        let manifest_err = |e: std::io::Error| SyncError::Manifest(format!("cannot write {}: {e}", path.display()));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(manifest_err)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(manifest_err)?;
        std::fs::rename(&tmp, path).map_err(manifest_err)?;
        debug!(path = %path.display(), entries = file.entries.len(), "manifest saved");
        Ok(())
    }
}
