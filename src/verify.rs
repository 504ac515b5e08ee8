//! Integrity verification by deterministic single-pass re-hash.
//!
//! Chunked copies land out of order, so their content hash is never folded
//! from per-chunk hashes. Instead both sides are re-read front to back once
//! every chunk is durable, giving the same BLAKE3 a sequential copy computes
//! inline.

use std::io;

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::hash::{ContentHasher, StrongHash};
use crate::record::RelPath;
use crate::transport::{ReadHandle, Transport};

/// Hash `[offset, offset + len)` of an open handle.
///
/// Stops early at end of object, so a short object hashes differently from
/// the full range.
///
/// # Errors
///
/// Propagates read errors.
pub fn hash_range<R: ReadHandle + ?Sized>(
    reader: &mut R,
    offset: u64,
    len: u64,
    buf: &mut [u8],
) -> io::Result<StrongHash> {
    let mut hasher = ContentHasher::new();
    let mut pos = offset;
    let end = offset.saturating_add(len);
    while pos < end {
        #[allow(clippy::cast_possible_truncation)]
        let want = (end - pos).min(buf.len() as u64) as usize;
        let n = reader.read_range(pos, &mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        pos += n as u64;
    }
    Ok(hasher.finalize())
}

/// Re-hashes source and destination objects through their transports.
#[derive(Debug, Clone, Copy)]
pub struct Verifier {
    buffer_size: usize,
}

impl Verifier {
    /// Verifier reading `buffer_size` bytes per call.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(4096),
        }
    }

    /// Hash `[offset, offset + len)` of `path` on `transport`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Transport`] if the object cannot be opened or read.
    pub fn hash<T: Transport>(&self, transport: &T, path: &RelPath, offset: u64, len: u64) -> Result<StrongHash> {
        let map = |e| SyncError::transport(transport.describe(path), e);
        let mut reader = transport.open_for_read(path).map_err(map)?;
        let mut buf = vec![0u8; self.buffer_size];
        hash_range(&mut reader, offset, len, &mut buf).map_err(map)
    }

    /// Hash the same range on both sides in parallel.
    ///
    /// # Errors
    ///
    /// The first transport error from either side.
    pub fn hash_pair<S: Transport, D: Transport>(
        &self,
        source: &S,
        dest: &D,
        path: &RelPath,
        offset: u64,
        len: u64,
    ) -> Result<(StrongHash, StrongHash)> {
        let (src, dst) = rayon::join(
            || self.hash(source, path, offset, len),
            || self.hash(dest, path, offset, len),
        );
        Ok((src?, dst?))
    }

    /// Whether both sides hold identical bytes in `[offset, offset + len)`.
    ///
    /// # Errors
    ///
    /// Transport failures; a mismatch is `Ok(false)`.
    pub fn range_matches<S: Transport, D: Transport>(
        &self,
        source: &S,
        dest: &D,
        path: &RelPath,
        offset: u64,
        len: u64,
    ) -> Result<bool> {
        let (src, dst) = self.hash_pair(source, dest, path, offset, len)?;
        Ok(src == dst)
    }

    /// Verify a completed file of `size` bytes and return its hash.
    ///
    /// # Errors
    ///
    /// [`SyncError::VerificationMismatch`] when sizes or hashes differ, or
    /// any transport failure.
    pub fn verify_file<S: Transport, D: Transport>(
        &self,
        source: &S,
        dest: &D,
        path: &RelPath,
        size: u64,
    ) -> Result<StrongHash> {
        let dest_size = dest
            .stat(path)
            .map_err(|e| SyncError::transport(dest.describe(path), e))?
            .map_or(0, |s| s.size);
        let (src, dst) = self.hash_pair(source, dest, path, 0, size)?;
        if dest_size != size || src != dst {
            warn!(path = %path, expected = %src, actual = %dst, size, dest_size, "verification mismatch");
            return Err(SyncError::VerificationMismatch {
                path: dest.describe(path),
                expected: src.to_hex(),
                actual: dst.to_hex(),
            });
        }
        debug!(path = %path, hash = %src, "verified");
        Ok(src)
    }

    /// Check the destination against a hash computed while streaming.
    ///
    /// # Errors
    ///
    /// [`SyncError::VerificationMismatch`] on difference, or any transport
    /// failure.
    pub fn verify_against<D: Transport>(&self, dest: &D, path: &RelPath, size: u64, expected: &StrongHash) -> Result<()> {
        let actual = self.hash(dest, path, 0, size)?;
        if actual != *expected {
            return Err(SyncError::VerificationMismatch {
                path: dest.describe(path),
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}
