//! Transport capability consumed by the copy executor.
//!
//! The engine is generic over [`Transport`] and never inspects which backend
//! it talks to. [`LocalTransport`] is the filesystem backend rooted at a
//! directory; remote backends implement the same trait.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use walkdir::WalkDir;

use crate::record::{Mtime, RelPath};

/// Size and modification time of a transport object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Logical size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mtime: Mtime,
}

/// Positional reader.
pub trait ReadHandle: Send {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read, 0 at end.
    ///
    /// # Errors
    ///
    /// Any backend I/O failure.
    fn read_range(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// Positional writer.
pub trait WriteHandle: Send {
    /// Write `data` at `offset`; returns how many bytes the backend accepted.
    ///
    /// # Errors
    ///
    /// Any backend I/O failure.
    fn write_range(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;

    /// Make every accepted byte durable.
    ///
    /// # Errors
    ///
    /// Any backend I/O failure.
    fn flush_and_sync(&mut self) -> io::Result<()>;

    /// Truncate or extend to `len` bytes.
    ///
    /// # Errors
    ///
    /// Any backend I/O failure.
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

/// Sequential [`Read`](std::io::Read) view over a positional handle.
#[derive(Debug)]
pub struct HandleReader<H> {
    handle: H,
    pos: u64,
}

impl<H: ReadHandle> HandleReader<H> {
    /// Reader starting at `offset`.
    pub const fn new(handle: H, offset: u64) -> Self {
        Self { handle, pos: offset }
    }

    /// Current offset.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.pos
    }
}

impl<H: ReadHandle> io::Read for HandleReader<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.handle.read_range(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Storage backend.
pub trait Transport: Send + Sync {
    /// Reader handle type.
    type Reader: ReadHandle;
    /// Writer handle type.
    type Writer: WriteHandle;

    /// Open for positional reads.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent, or any backend failure.
    fn open_for_read(&self, path: &RelPath) -> io::Result<Self::Reader>;

    /// Open for positional writes, creating the object (and parents) if
    /// needed. Existing content is never truncated.
    ///
    /// # Errors
    ///
    /// Any backend failure.
    fn open_for_write(&self, path: &RelPath) -> io::Result<Self::Writer>;

    /// Stat an object; `Ok(None)` when it does not exist.
    ///
    /// # Errors
    ///
    /// Any backend failure other than absence.
    fn stat(&self, path: &RelPath) -> io::Result<Option<FileStat>>;

    /// Atomically replace `to` with `from`.
    ///
    /// # Errors
    ///
    /// Any backend failure.
    fn rename(&self, from: &RelPath, to: &RelPath) -> io::Result<()>;

    /// Delete an object. Absence is not an error.
    ///
    /// # Errors
    ///
    /// Any backend failure.
    fn remove(&self, path: &RelPath) -> io::Result<()>;

    /// Apply permission bits. Backends without permissions ignore this.
    ///
    /// # Errors
    ///
    /// Any backend failure.
    fn set_permissions(&self, _path: &RelPath, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    /// Give the owner write access to an existing object left read-only by
    /// an earlier permission copy. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Any backend failure other than absence.
    fn make_writable(&self, _path: &RelPath) -> io::Result<bool> {
        Ok(false)
    }

    /// Set the modification time. Backends without timestamps ignore this.
    ///
    /// # Errors
    ///
    /// Any backend failure.
    fn set_mtime(&self, _path: &RelPath, _mtime: Mtime) -> io::Result<()> {
        Ok(())
    }

    /// Every regular file under the root, for extraneous-file deletion.
    ///
    /// # Errors
    ///
    /// `Unsupported` for backends that cannot enumerate, or any backend
    /// failure.
    fn list(&self) -> io::Result<Vec<RelPath>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "listing not supported"))
    }

    /// Make sure the root exists and accepts writes.
    ///
    /// # Errors
    ///
    /// Any backend failure.
    fn prepare(&self) -> io::Result<()> {
        Ok(())
    }

    /// Human-readable location of `path`, for logs and errors.
    fn describe(&self, path: &RelPath) -> PathBuf {
        path.to_path_buf()
    }
}

/// Local filesystem backend rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Backend rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &RelPath) -> PathBuf {
        path.under(&self.root)
    }
}

/// Open file used as either handle type.
#[derive(Debug)]
pub struct LocalFile {
    file: File,
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, data, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, data, offset)
}

impl ReadHandle for LocalFile {
    fn read_range(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match read_at(&self.file, buf, offset) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

impl WriteHandle for LocalFile {
    fn write_range(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        loop {
            match write_at(&self.file, data, offset) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }

    fn flush_and_sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

impl Transport for LocalTransport {
    type Reader = LocalFile;
    type Writer = LocalFile;

    fn open_for_read(&self, path: &RelPath) -> io::Result<LocalFile> {
        File::open(self.full(path)).map(|file| LocalFile { file })
    }

    fn open_for_write(&self, path: &RelPath) -> io::Result<LocalFile> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(full)
            .map(|file| LocalFile { file })
    }

    fn stat(&self, path: &RelPath) -> io::Result<Option<FileStat>> {
        match std::fs::metadata(self.full(path)) {
            Ok(meta) => Ok(Some(FileStat {
                size: meta.len(),
                mtime: Mtime::from_system_time(meta.modified()?),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn rename(&self, from: &RelPath, to: &RelPath) -> io::Result<()> {
        std::fs::rename(self.full(from), self.full(to))
    }

    fn remove(&self, path: &RelPath) -> io::Result<()> {
        match std::fs::remove_file(self.full(path)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    #[cfg(unix)]
    fn set_permissions(&self, path: &RelPath, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(self.full(path), std::fs::Permissions::from_mode(mode))
    }

    #[cfg(unix)]
    fn make_writable(&self, path: &RelPath) -> io::Result<bool> {
        use std::os::unix::fs::PermissionsExt;
        let full = self.full(path);
        let mode = match std::fs::metadata(&full) {
            Ok(meta) => meta.permissions().mode(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if mode & 0o200 != 0 {
            return Ok(false);
        }
        std::fs::set_permissions(full, std::fs::Permissions::from_mode(mode | 0o200))?;
        Ok(true)
    }

    fn set_mtime(&self, path: &RelPath, mtime: Mtime) -> io::Result<()> {
        filetime::set_file_mtime(self.full(path), FileTime::from_unix_time(mtime.secs, mtime.nanos))
    }

    fn list(&self) -> io::Result<Vec<RelPath>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                files.push(RelPath::from_path(rel));
            }
        }
        Ok(files)
    }

    fn prepare(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let probe = self.root.join(".chunksync-probe");
        File::create(&probe)?;
        std::fs::remove_file(probe)
    }

    fn describe(&self, path: &RelPath) -> PathBuf {
        self.full(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(dir.path());
        let path = RelPath::from("deep/nested/file.bin");

        let mut writer = transport.open_for_write(&path).unwrap();
        writer.set_len(10).unwrap();
        assert_eq!(writer.write_range(6, b"tail").unwrap(), 4);
        assert_eq!(writer.write_range(0, b"head").unwrap(), 4);
        writer.flush_and_sync().unwrap();

        let mut reader = transport.open_for_read(&path).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(reader.read_range(0, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"head\0\0tail");
        assert_eq!(reader.read_range(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn open_for_write_does_not_truncate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep"), b"existing").unwrap();
        let transport = LocalTransport::new(dir.path());
        drop(transport.open_for_write(&RelPath::from("keep")).unwrap());
        assert_eq!(std::fs::read(dir.path().join("keep")).unwrap(), b"existing");
    }

    #[test]
    fn stat_rename_remove() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(dir.path());
        let a = RelPath::from("a");
        let b = RelPath::from("b");
        assert_eq!(transport.stat(&a).unwrap(), None);

        std::fs::write(dir.path().join("a"), b"12345").unwrap();
        assert_eq!(transport.stat(&a).unwrap().map(|s| s.size), Some(5));

        transport.rename(&a, &b).unwrap();
        assert!(transport.stat(&a).unwrap().is_none());
        transport.remove(&b).unwrap();
        transport.remove(&b).unwrap();
        assert!(transport.stat(&b).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn make_writable_adds_owner_write() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("ro");
        std::fs::write(&full, b"x").unwrap();
        std::fs::set_permissions(&full, std::fs::Permissions::from_mode(0o444)).unwrap();
        let transport = LocalTransport::new(dir.path());
        let path = RelPath::from("ro");

        assert!(transport.make_writable(&path).unwrap());
        assert_eq!(std::fs::metadata(&full).unwrap().permissions().mode() & 0o777, 0o644);
        assert!(!transport.make_writable(&path).unwrap());
        assert!(!transport.make_writable(&RelPath::from("absent")).unwrap());
    }

    #[test]
    fn set_mtime_round_trips_through_stat() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let transport = LocalTransport::new(dir.path());
        let path = RelPath::from("f");
        let when = Mtime {
            secs: 1_704_067_200,
            nanos: 0,
        };
        transport.set_mtime(&path, when).unwrap();
        assert_eq!(transport.stat(&path).unwrap().map(|s| s.mtime), Some(when));
    }

    #[test]
    fn list_walks_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/deep"), b"1").unwrap();
        std::fs::write(dir.path().join("top"), b"2").unwrap();
        let listed = LocalTransport::new(dir.path()).list().unwrap();
        assert_eq!(listed, vec![RelPath::from("a/b/deep"), RelPath::from("top")]);
        assert!(LocalTransport::new(dir.path().join("missing")).list().unwrap().is_empty());
    }

    #[test]
    fn prepare_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(dir.path().join("new/root"));
        transport.prepare().unwrap();
        assert!(dir.path().join("new/root").is_dir());
    }

    #[test]
    fn handle_reader_streams_from_offset() {
        use std::io::Read;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
        let handle = LocalTransport::new(dir.path()).open_for_read(&RelPath::from("f")).unwrap();
        let mut reader = HandleReader::new(handle, 3);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "3456789");
        assert_eq!(reader.position(), 10);
    }

    #[test]
    fn open_missing_for_read_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalTransport::new(dir.path())
            .open_for_read(&RelPath::from("nope"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
