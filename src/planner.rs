//! Per-file sync decisions.

use std::io;

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::manifest::ManifestStore;
use crate::record::{FileRecord, RelPath};
use crate::scan::PathFilter;
use crate::signature::SignatureTable;
use crate::transport::Transport;

/// What to do with one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Unchanged since the last sync.
    Skip,
    /// Copy every byte.
    Full,
    /// Rebuild from the existing destination, optionally with block
    /// signatures recorded at the last sync.
    Delta {
        /// Signatures from the manifest, if retained.
        cached: Option<SignatureTable>,
    },
}

impl SyncAction {
    /// Short label for logs and reports.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Full => "full",
            Self::Delta { .. } => "delta",
        }
    }
}

/// A file with its decided action.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    /// Scanned metadata.
    pub record: FileRecord,
    /// Decision.
    pub action: SyncAction,
}

/// Decisions for a whole job, with totals fixed for progress reporting.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Files in scheduling order.
    pub files: Vec<PlannedFile>,
    /// Sum of all file sizes.
    pub total_bytes: u64,
}

impl SyncPlan {
    /// Number of files.
    #[must_use]
    pub fn total_files(&self) -> u64 {
        self.files.len() as u64
    }

    /// Files and bytes in the skip bucket.
    #[must_use]
    pub fn skipped(&self) -> (u64, u64) {
        self.files
            .iter()
            .filter(|f| f.action == SyncAction::Skip)
            .fold((0, 0), |(n, b), f| (n + 1, b + f.record.size))
    }

    /// Number of files planned for delta sync.
    #[must_use]
    pub fn delta_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.action, SyncAction::Delta { .. }))
            .count()
    }
}

/// Consults the manifest and destination to decide each file's action.
#[derive(Debug)]
pub struct Planner<'a> {
    manifest: &'a ManifestStore,
    incremental: bool,
    delta: bool,
    delta_min_size: u64,
    reuse_signatures: bool,
    delete_extra: bool,
}

impl<'a> Planner<'a> {
    /// Planner for the given manifest and job settings.
    #[must_use]
    pub const fn new(manifest: &'a ManifestStore, config: &SyncConfig) -> Self {
        Self {
            manifest,
            incremental: config.incremental,
            delta: config.delta,
            delta_min_size: config.delta_min_size,
            // Stored signatures are trusted only when the result is verified.
            reuse_signatures: config.verify,
            delete_extra: config.delete_extra,
        }
    }

    /// Decide one file given the destination's current size, if it exists.
    #[must_use]
    pub fn decide(&self, record: &FileRecord, dest_size: Option<u64>) -> SyncAction {
        let Some(entry) = self.manifest.get(&record.path) else {
            return SyncAction::Full;
        };
        let Some(dest_size) = dest_size else {
            return SyncAction::Full;
        };
        if self.incremental && entry.matches_metadata(record) && dest_size == entry.size {
            return SyncAction::Skip;
        }
        if self.delta && record.size >= self.delta_min_size && dest_size > 0 {
            let cached = if self.reuse_signatures { entry.signature } else { None };
            return SyncAction::Delta { cached };
        }
        SyncAction::Full
    }

    /// Plan every record against `dest`.
    ///
    /// A destination that cannot be stat'ed is treated as absent.
    #[must_use]
    pub fn plan<D: Transport>(&self, records: Vec<FileRecord>, dest: &D) -> SyncPlan {
        let mut plan = SyncPlan::default();
        for record in records {
            let dest_size = match dest.stat(&record.path) {
                Ok(stat) => stat.map(|s| s.size),
                Err(e) => {
                    warn!(path = %record.path, error = %e, "cannot stat destination, planning full copy");
                    None
                }
            };
            let action = self.decide(&record, dest_size);
            debug!(path = %record.path, size = record.size, action = action.label(), "planned");
            plan.total_bytes += record.size;
            plan.files.push(PlannedFile { record, action });
        }
        plan
    }

    /// Destination files to delete: not in `plan`, covered by `filter`, and
    /// absent from the source. Empty unless extraneous deletion is enabled.
    ///
    /// A source file the scan filtered out by size is still present at the
    /// source, so its destination copy is kept.
    ///
    /// # Errors
    ///
    /// Failure listing the destination.
    pub fn extraneous<S: Transport, D: Transport>(
        &self,
        plan: &SyncPlan,
        filter: &PathFilter,
        source: &S,
        dest: &D,
    ) -> io::Result<Vec<RelPath>> {
        if !self.delete_extra {
            return Ok(Vec::new());
        }
        let planned: FxHashSet<&RelPath> = plan.files.iter().map(|f| &f.record.path).collect();
        let mut extra = Vec::new();
        for path in dest.list()? {
            if planned.contains(&path) || !filter.covers(&path.to_path_buf()) {
                continue;
            }
            match source.stat(&path) {
                Ok(None) => {
                    debug!(path = %path, "extraneous destination file");
                    extra.push(path);
                }
                Ok(Some(_)) => {}
                Err(e) => warn!(path = %path, error = %e, "cannot stat source, keeping destination file"),
            }
        }
        Ok(extra)
    }
}
