//! Directory scanning.
//!
//! [`Scanner::iter`] walks the source root lazily and yields one
//! [`FileRecord`] per regular file that passes the filters. Unreadable
//! entries come out as [`SyncError::Scan`] and the walk carries on.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::record::{FileRecord, RelPath};

/// Order in which files are handed to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingStrategy {
    /// Walk order; records can stream.
    #[default]
    None,
    /// Smallest files first.
    SmallestFirst,
    /// Largest files first.
    LargestFirst,
    /// Most recently modified first.
    NewestFirst,
    /// Least recently modified first.
    OldestFirst,
}

impl OrderingStrategy {
    /// Whether the full record set must be collected before ordering.
    #[must_use]
    pub const fn requires_materialization(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Sort records in place. Ties keep path order.
    pub fn apply(self, records: &mut [FileRecord]) {
        match self {
            Self::None => {}
            Self::SmallestFirst => records.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.path.cmp(&b.path))),
            Self::LargestFirst => records.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path))),
            Self::NewestFirst => records.sort_by(|a, b| b.mtime.cmp(&a.mtime).then_with(|| a.path.cmp(&b.path))),
            Self::OldestFirst => records.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.path.cmp(&b.path))),
        }
    }
}

impl FromStr for OrderingStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "smallest-first" | "smallest" => Ok(Self::SmallestFirst),
            "largest-first" | "largest" => Ok(Self::LargestFirst),
            "newest-first" | "newest" => Ok(Self::NewestFirst),
            "oldest-first" | "oldest" => Ok(Self::OldestFirst),
            other => Err(SyncError::config(format!("unknown ordering strategy '{other}'"))),
        }
    }
}

/// Filters applied while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Follow symbolic links.
    pub follow_symlinks: bool,
    /// Include dot-files and dot-directories.
    pub include_hidden: bool,
    /// Only paths matching one of these globs (empty = all).
    pub include: Vec<String>,
    /// Drop paths matching any of these globs.
    pub exclude: Vec<String>,
    /// Smallest file size to keep.
    pub min_size: Option<u64>,
    /// Largest file size to keep.
    pub max_size: Option<u64>,
    /// Ordering applied by [`Scanner::collect_ordered`].
    pub ordering: OrderingStrategy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            include_hidden: true,
            include: Vec::new(),
            exclude: Vec::new(),
            min_size: None,
            max_size: None,
            ordering: OrderingStrategy::None,
        }
    }
}

/// Records and per-entry errors from a full pass.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Accepted records, ordered per the configured strategy.
    pub records: Vec<FileRecord>,
    /// Entries that could not be read.
    pub errors: Vec<SyncError>,
}

impl ScanOutcome {
    /// Sum of record sizes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }
}

/// Compiled include/exclude globs and the hidden-file rule of a
/// [`ScanOptions`], independent of any root.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
    include_hidden: bool,
}

impl PathFilter {
    /// Compile the filters of `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] for an invalid glob.
    pub fn new(options: &ScanOptions) -> Result<Self> {
        Ok(Self {
            include: build_globset(&options.include)?,
            exclude: build_globset(&options.exclude)?,
            include_hidden: options.include_hidden,
        })
    }

    /// Whether the globs admit `rel`.
    #[must_use]
    pub fn matches(&self, rel: &Path) -> bool {
        if !self.include.is_empty() && !self.include.is_match(rel) {
            return false;
        }
        !self.exclude.is_match(rel)
    }

    /// Whether a scan would look at `rel` at all: the globs admit it and no
    /// component is hidden unless hidden entries are included.
    #[must_use]
    pub fn covers(&self, rel: &Path) -> bool {
        let hidden = rel
            .components()
            .any(|c| c.as_os_str().as_encoded_bytes().first() == Some(&b'.'));
        (self.include_hidden || !hidden) && self.matches(rel)
    }
}

/// Compiled scanner for one source root.
#[derive(Debug)]
pub struct Scanner {
    root: PathBuf,
    options: ScanOptions,
    filter: PathFilter,
}

impl Scanner {
    /// Compile the glob filters for `root`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] for an invalid glob.
    pub fn new(root: impl Into<PathBuf>, options: ScanOptions) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            filter: PathFilter::new(&options)?,
            options,
        })
    }

    /// Source root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazy walk in file-name order. Each call starts a fresh enumeration.
    #[must_use]
    pub fn iter(&self) -> ScanIter<'_> {
        let walker = WalkDir::new(&self.root)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter();
        ScanIter {
            scanner: self,
            walker,
        }
    }

    /// Run a full pass and apply the ordering strategy.
    #[must_use]
    pub fn collect_ordered(&self) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        for item in self.iter() {
            match item {
                Ok(record) => outcome.records.push(record),
                Err(e) => {
                    warn!(error = %e, "scan entry skipped");
                    outcome.errors.push(e);
                }
            }
        }
        self.options.ordering.apply(&mut outcome.records);
        debug!(
            root = %self.root.display(),
            files = outcome.records.len(),
            errors = outcome.errors.len(),
            "scan complete"
        );
        outcome
    }

    fn accepts(&self, rel: &Path, size: u64) -> bool {
        if self.options.min_size.is_some_and(|min| size < min) {
            return false;
        }
        if self.options.max_size.is_some_and(|max| size > max) {
            return false;
        }
        self.filter.matches(rel)
    }
}

/// Lazy, non-restartable scan sequence.
pub struct ScanIter<'a> {
    scanner: &'a Scanner,
    walker: walkdir::IntoIter,
}

impl Iterator for ScanIter<'_> {
    type Item = Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map_or_else(|| self.scanner.root.clone(), Path::to_path_buf);
                    return Some(Err(SyncError::scan(path, e.to_string())));
                }
            };

            if entry.depth() > 0
                && !self.scanner.options.include_hidden
                && entry.file_name().as_encoded_bytes().first() == Some(&b'.')
            {
                if entry.file_type().is_dir() {
                    self.walker.skip_current_dir();
                }
                continue;
            }

            if !entry.file_type().is_file() {
                continue;
            }

            let rel = match entry.path().strip_prefix(&self.scanner.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => return Some(Err(SyncError::scan(entry.path(), e.to_string()))),
            };
            if !self.scanner.accepts(&rel, metadata.len()) {
                continue;
            }
            return Some(Ok(FileRecord::from_metadata(RelPath::from_path(&rel), &metadata)));
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::config(format!("invalid glob pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::config(format!("failed to build glob set: {e}")))
}
