//! File records produced by the scanner.
//!
//! Paths are kept as raw bytes so names that are not valid UTF-8 survive the
//! round trip through the manifest and checkpoint files.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Relative path stored as its raw OS bytes.
///
/// In human-readable formats it serializes as a plain string when the bytes
/// are valid UTF-8 and as `{"path": "<lossy>", "path_bytes": "<hex>"}`
/// otherwise. Binary formats carry the bytes directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelPath(Vec<u8>);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RelPathRepr {
    Text(String),
    Raw { path: String, path_bytes: String },
}

impl RelPath {
    /// Build from a relative filesystem path.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            Self(path.as_os_str().as_bytes().to_vec())
        }
        #[cfg(not(unix))]
        {
            Self(path.to_string_lossy().replace('\\', "/").into_bytes())
        }
    }

    /// Build from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw path bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the name round-trips through UTF-8 unchanged.
    #[must_use]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.0).is_ok()
    }

    /// Lossy display form.
    #[must_use]
    pub fn display(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    /// Convert back into a path relative to some root.
    #[must_use]
    pub fn to_path_buf(&self) -> PathBuf {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            PathBuf::from(std::ffi::OsStr::from_bytes(&self.0))
        }
        #[cfg(not(unix))]
        {
            PathBuf::from(self.display().into_owned())
        }
    }

    /// Join onto an absolute root.
    #[must_use]
    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(self.to_path_buf())
    }

    /// Sibling path with `suffix` appended to the file name.
    #[must_use]
    pub fn with_suffix(&self, suffix: &str) -> Self {
        let mut bytes = self.0.clone();
        bytes.extend_from_slice(suffix.as_bytes());
        Self(bytes)
    }
}

impl std::fmt::Display for RelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

impl From<&str> for RelPath {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Serialize for RelPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !serializer.is_human_readable() {
            return self.0.serialize(serializer);
        }
        let repr = match std::str::from_utf8(&self.0) {
            Ok(text) => RelPathRepr::Text(text.to_owned()),
            Err(_) => RelPathRepr::Raw {
                path: self.display().into_owned(),
                path_bytes: hex::encode(&self.0),
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RelPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if !deserializer.is_human_readable() {
            return Vec::<u8>::deserialize(deserializer).map(Self);
        }
        match RelPathRepr::deserialize(deserializer)? {
            RelPathRepr::Text(text) => Ok(Self(text.into_bytes())),
            RelPathRepr::Raw { path_bytes, .. } => hex::decode(&path_bytes)
                .map(Self)
                .map_err(|e| serde::de::Error::custom(format!("invalid raw path bytes: {e}"))),
        }
    }
}

/// Modification time with nanosecond precision, relative to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Mtime {
    /// Whole seconds (negative before 1970).
    pub secs: i64,
    /// Sub-second nanoseconds.
    pub nanos: u32,
}

impl Mtime {
    /// Convert from a [`SystemTime`].
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Self {
                        secs: -(d.as_secs() as i64),
                        nanos: 0,
                    }
                } else {
                    Self {
                        secs: -(d.as_secs() as i64) - 1,
                        nanos: 1_000_000_000 - d.subsec_nanos(),
                    }
                }
            }
        }
    }

    /// Build from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }
}

/// One regular file found by a scan pass. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the scan root.
    pub path: RelPath,
    /// Logical size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mtime: Mtime,
    /// Unix permission bits (0o644 on other platforms).
    pub permissions: u32,
    /// Allocated blocks cover less than the logical size.
    pub sparse: bool,
}

impl FileRecord {
    /// Build a record from filesystem metadata.
    #[must_use]
    pub fn from_metadata(path: RelPath, metadata: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let (permissions, sparse) = {
            use std::os::unix::fs::MetadataExt;
            let allocated = metadata.blocks().saturating_mul(512);
            (metadata.mode() & 0o7777, allocated < metadata.len())
        };
        #[cfg(not(unix))]
        let (permissions, sparse) = (0o644, false);

        Self {
            path,
            size: metadata.len(),
            mtime: Mtime::from_system_time(metadata.modified().unwrap_or(UNIX_EPOCH)),
            permissions,
            sparse,
        }
    }
}
