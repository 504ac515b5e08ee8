//! Moves bytes between transports.
//!
//! Every write's returned length is checked against the request; a short
//! write fails the attempt with [`SyncError::ShortWrite`] and the confirmed
//! offset only ever covers bytes that were written and then synced.

use std::borrow::Cow;

use tracing::{debug, trace, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::chunk::ChunkRange;
use crate::config::SyncConfig;
use crate::delta::{validate_copy, DeltaEngine, DeltaOp};
use crate::error::{Result, SyncError};
use crate::hash::{ContentHasher, StrongHash};
use crate::pool::CancelToken;
use crate::record::{FileRecord, RelPath};
use crate::signature::SignatureTable;
use crate::throttle::RateLimit;
use crate::transport::{HandleReader, ReadHandle, Transport, WriteHandle};
use crate::verify::Verifier;

/// Suffix of the staging object a delta reconstruction is written to.
pub const STAGING_SUFFIX: &str = ".chunksync-partial";

/// Result of a delta reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Hash of the new content.
    pub hash: StrongHash,
    /// Size of the new content.
    pub size: u64,
    /// Bytes reused from the old destination.
    pub bytes_matched: u64,
    /// Bytes sent as literals.
    pub bytes_literal: u64,
}

/// Copies whole files, chunks and deltas from `S` to `D`.
pub struct CopyExecutor<'a, S, D> {
    source: &'a S,
    dest: &'a D,
    throttle: &'a dyn RateLimit,
    cancel: CancelToken,
    checkpoints: Option<(&'a CheckpointStore, &'a str)>,
    verifier: Verifier,
    buffer_size: usize,
    checkpoint_interval: u64,
    verify: bool,
    preserve_permissions: bool,
    preserve_times: bool,
}

impl<'a, S: Transport, D: Transport> CopyExecutor<'a, S, D> {
    /// Executor using the buffer, checkpoint and verification settings of
    /// `config`.
    #[must_use]
    pub fn new(source: &'a S, dest: &'a D, throttle: &'a dyn RateLimit, config: &SyncConfig) -> Self {
        Self {
            source,
            dest,
            throttle,
            cancel: CancelToken::new(),
            checkpoints: None,
            verifier: Verifier::new(config.buffer_size),
            buffer_size: config.buffer_size.max(4096),
            checkpoint_interval: config.checkpoint_interval,
            verify: config.verify,
            preserve_permissions: config.preserve_permissions,
            preserve_times: config.preserve_times,
        }
    }

    /// Record progress in `store` under `transfer_id`.
    #[must_use]
    pub fn with_checkpoints(mut self, store: &'a CheckpointStore, transfer_id: &'a str) -> Self {
        self.checkpoints = Some((store, transfer_id));
        self
    }

    /// Stop at segment and chunk boundaries once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Verifier used for final checks.
    #[must_use]
    pub const fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    fn src_err(&self, path: &RelPath) -> impl Fn(std::io::Error) -> SyncError + '_ {
        let at = self.source.describe(path);
        move |e| SyncError::transport(at.clone(), e)
    }

    fn dst_err(&self, path: &RelPath) -> impl Fn(std::io::Error) -> SyncError + '_ {
        let at = self.dest.describe(path);
        move |e| SyncError::transport(at.clone(), e)
    }

    /// Open the live destination object for writing. One left read-only by
    /// an earlier permission copy is made owner-writable first; the
    /// recorded mode is restored by [`Self::apply_metadata`].
    fn open_dest(&self, path: &RelPath) -> Result<D::Writer> {
        match self.dest.open_for_write(path) {
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                if !self.dest.make_writable(path).map_err(self.dst_err(path))? {
                    return Err(SyncError::transport(self.dest.describe(path), e));
                }
                debug!(path = %path, "destination was read-only, made writable");
                self.dest.open_for_write(path).map_err(self.dst_err(path))
            }
            other => other.map_err(self.dst_err(path)),
        }
    }

    fn write_at(&self, writer: &mut D::Writer, path: &RelPath, offset: u64, data: &[u8]) -> Result<()> {
        let written = writer.write_range(offset, data).map_err(self.dst_err(path))?;
        if written != data.len() {
            return Err(SyncError::ShortWrite {
                path: self.dest.describe(path),
                offset,
                expected: data.len(),
                written,
            });
        }
        Ok(())
    }

    /// Copy `[offset, offset + len)` of `path` through `buf`.
    ///
    /// With `skip_zeros`, all-zero pieces are neither written nor throttled;
    /// the caller guarantees the destination reads zeros there.
    #[allow(clippy::too_many_arguments)]
    fn copy_range(
        &self,
        reader: &mut S::Reader,
        writer: &mut D::Writer,
        path: &RelPath,
        offset: u64,
        len: u64,
        buf: &mut [u8],
        mut hasher: Option<&mut ContentHasher>,
        skip_zeros: bool,
    ) -> Result<()> {
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            #[allow(clippy::cast_possible_truncation)]
            let want = (end - pos).min(buf.len() as u64) as usize;
            let n = reader.read_range(pos, &mut buf[..want]).map_err(self.src_err(path))?;
            if n == 0 {
                return Err(SyncError::transport(
                    self.source.describe(path),
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "source shrank during copy"),
                ));
            }
            let data = &buf[..n];
            if let Some(h) = hasher.as_deref_mut() {
                h.update(data);
            }
            if !(skip_zeros && data.iter().all(|&b| b == 0)) {
                self.throttle.acquire(n as u64);
                self.write_at(writer, path, pos, data)?;
            }
            pos += n as u64;
        }
        Ok(())
    }

    /// Copy a file sequentially, hashing inline, starting at a verified
    /// `resume_from` offset. Progress is checkpointed after every
    /// `checkpoint_interval` bytes, once they are synced.
    ///
    /// # Errors
    ///
    /// Transport, short-write, checkpoint or verification failures, and
    /// [`SyncError::Cancelled`] between segments.
    pub fn copy_whole(&self, record: &FileRecord, resume_from: u64) -> Result<StrongHash> {
        let path = &record.path;
        let size = record.size;
        let resume_from = resume_from.min(size);
        let mut reader = self.source.open_for_read(path).map_err(self.src_err(path))?;
        let mut writer = self.open_dest(path)?;
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; (self.buffer_size as u64).min(size.max(1)) as usize];
        let mut hasher = ContentHasher::new();

        // Holes are only safe to leave when the destination starts empty.
        let sparse = record.sparse && resume_from == 0;
        if sparse {
            writer.set_len(0).map_err(self.dst_err(path))?;
        }

        if resume_from > 0 {
            self.hash_prefix(&mut reader, path, resume_from, &mut buf, &mut hasher)?;
            debug!(path = %path, offset = resume_from, "resuming sequential copy");
        }

        let checkpoint = self
            .checkpoints
            .map(|(store, id)| (store, Checkpoint::new(id, path.clone(), size, 0)));
        let segment = self.checkpoint_interval.max(buf.len() as u64);
        let mut pos = resume_from;
        while pos < size {
            self.cancel.check()?;
            let len = segment.min(size - pos);
            self.copy_range(&mut reader, &mut writer, path, pos, len, &mut buf, Some(&mut hasher), sparse)?;
            pos += len;
            if let Some((store, cp)) = &checkpoint {
                if sparse {
                    writer.set_len(pos).map_err(self.dst_err(path))?;
                }
                writer.flush_and_sync().map_err(self.dst_err(path))?;
                store.save(&cp.at_offset(pos))?;
            }
        }
        writer.set_len(size).map_err(self.dst_err(path))?;
        writer.flush_and_sync().map_err(self.dst_err(path))?;
        drop(writer);

        let hash = hasher.finalize();
        if self.verify {
            self.verifier.verify_against(self.dest, path, size, &hash)?;
        }
        trace!(path = %path, bytes = size - resume_from, hash = %hash, "sequential copy done");
        Ok(hash)
    }

    fn hash_prefix(
        &self,
        reader: &mut S::Reader,
        path: &RelPath,
        len: u64,
        buf: &mut [u8],
        hasher: &mut ContentHasher,
    ) -> Result<()> {
        let mut pos = 0;
        while pos < len {
            #[allow(clippy::cast_possible_truncation)]
            let want = (len - pos).min(buf.len() as u64) as usize;
            let n = reader.read_range(pos, &mut buf[..want]).map_err(self.src_err(path))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            pos += n as u64;
        }
        Ok(())
    }

    /// Copy one chunk and checkpoint it once synced.
    ///
    /// # Errors
    ///
    /// Transport, short-write or checkpoint failures, and
    /// [`SyncError::Cancelled`] if cancelled before the chunk starts.
    pub fn copy_chunk(&self, record: &FileRecord, range: ChunkRange, chunk_size: u64) -> Result<()> {
        self.cancel.check()?;
        let path = &record.path;
        let mut reader = self.source.open_for_read(path).map_err(self.src_err(path))?;
        let mut writer = self.open_dest(path)?;
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; (self.buffer_size as u64).min(range.len.max(1)) as usize];
        self.copy_range(&mut reader, &mut writer, path, range.offset, range.len, &mut buf, None, false)?;
        writer.flush_and_sync().map_err(self.dst_err(path))?;
        if let Some((store, id)) = self.checkpoints {
            store.save(&Checkpoint::new(id, path.clone(), record.size, chunk_size).with_chunk(range.index))?;
        }
        trace!(path = %path, chunk = range.index, offset = range.offset, len = range.len, "chunk landed");
        Ok(())
    }

    /// Seal a chunked file once every chunk has landed: fix its length and
    /// compute its hash with a single front-to-back pass.
    ///
    /// # Errors
    ///
    /// Transport failures, or [`SyncError::VerificationMismatch`] when
    /// verification is enabled and the sides differ.
    pub fn finish_chunked(&self, record: &FileRecord) -> Result<StrongHash> {
        let path = &record.path;
        let mut writer = self.open_dest(path)?;
        writer.set_len(record.size).map_err(self.dst_err(path))?;
        writer.flush_and_sync().map_err(self.dst_err(path))?;
        drop(writer);
        if self.verify {
            self.verifier.verify_file(self.source, self.dest, path, record.size)
        } else {
            self.verifier.hash(self.source, path, 0, record.size)
        }
    }

    /// Block signatures of the current destination content.
    ///
    /// # Errors
    ///
    /// [`SyncError::DeltaSignature`] for any failure opening or reading it.
    pub fn dest_signature(&self, path: &RelPath, engine: &DeltaEngine) -> Result<SignatureTable> {
        let at = self.dest.describe(path);
        let handle = self
            .dest
            .open_for_read(path)
            .map_err(|e| SyncError::delta_signature(at.clone(), e))?;
        engine
            .signature(&mut HandleReader::new(handle, 0))
            .map_err(|e| SyncError::delta_signature(at, e))
    }

    /// Rebuild `record` at the destination from the existing content plus
    /// literals, via a staging object renamed over the old file.
    ///
    /// `cached` signatures are used when they describe the destination's
    /// current size and the engine's block size.
    ///
    /// # Errors
    ///
    /// [`SyncError::DeltaSignature`] when the destination cannot be signed
    /// (the caller falls back to a full copy); transport, short-write and
    /// verification failures otherwise.
    pub fn sync_delta(
        &self,
        record: &FileRecord,
        engine: &DeltaEngine,
        cached: Option<&SignatureTable>,
    ) -> Result<DeltaOutcome> {
        self.cancel.check()?;
        let path = &record.path;
        let basis_size = self
            .dest
            .stat(path)
            .map_err(|e| SyncError::delta_signature(self.dest.describe(path), e))?
            .map(|s| s.size)
            .ok_or_else(|| SyncError::delta_signature(self.dest.describe(path), "destination missing"))?;

        let table = match cached.filter(|t| t.file_size() == basis_size && t.block_size() == engine.block_size()) {
            Some(table) => Cow::Borrowed(table),
            None => Cow::Owned(self.dest_signature(path, engine)?),
        };

        let staging = path.with_suffix(STAGING_SUFFIX);
        let outcome = match self.build_staged(path, engine, &table, &staging, basis_size) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(cleanup) = self.dest.remove(&staging) {
                    warn!(path = %staging, error = %cleanup, "could not remove staging file");
                }
                return Err(e);
            }
        };
        self.dest.rename(&staging, path).map_err(self.dst_err(path))?;
        debug!(
            path = %path,
            matched = outcome.bytes_matched,
            literal = outcome.bytes_literal,
            "delta applied"
        );
        Ok(outcome)
    }

    fn build_staged(
        &self,
        path: &RelPath,
        engine: &DeltaEngine,
        table: &SignatureTable,
        staging: &RelPath,
        basis_size: u64,
    ) -> Result<DeltaOutcome> {
        let mut basis = self.dest.open_for_read(path).map_err(self.dst_err(path))?;
        let mut out = self.dest.open_for_write(staging).map_err(self.dst_err(staging))?;
        out.set_len(0).map_err(self.dst_err(staging))?;
        let mut source = HandleReader::new(self.source.open_for_read(path).map_err(self.src_err(path))?, 0);

        let mut buf = vec![0u8; table.block_size().max(1)];
        let mut pos = 0u64;
        let stats = engine.stream(&mut source, table, |op| {
            match op {
                DeltaOp::Copy { offset, len: copy_len } => {
                    validate_copy(offset, copy_len, basis_size)?;
                    let mut done = 0u64;
                    let len = u64::from(copy_len);
                    while done < len {
                        #[allow(clippy::cast_possible_truncation)]
                        let want = (len - done).min(buf.len() as u64) as usize;
                        let n = basis
                            .read_range(offset + done, &mut buf[..want])
                            .map_err(self.dst_err(path))?;
                        if n == 0 {
                            return Err(SyncError::InvalidCopyBounds {
                                offset,
                                len: copy_len,
                                basis_size,
                            });
                        }
                        self.write_at(&mut out, staging, pos, &buf[..n])?;
                        pos += n as u64;
                        done += n as u64;
                    }
                }
                DeltaOp::Literal(data) => {
                    self.throttle.acquire(data.len() as u64);
                    self.write_at(&mut out, staging, pos, &data)?;
                    pos += data.len() as u64;
                }
            }
            Ok(())
        })?;

        out.set_len(pos).map_err(self.dst_err(staging))?;
        out.flush_and_sync().map_err(self.dst_err(staging))?;
        drop(out);
        if self.verify {
            self.verifier.verify_against(self.dest, staging, stats.source_size, &stats.source_hash)?;
        }
        Ok(DeltaOutcome {
            hash: stats.source_hash,
            size: stats.source_size,
            bytes_matched: stats.bytes_matched,
            bytes_literal: stats.bytes_literal,
        })
    }

    /// Apply the modification time and permission bits when configured to.
    ///
    /// # Errors
    ///
    /// Transport failure setting them.
    pub fn apply_metadata(&self, record: &FileRecord) -> Result<()> {
        if self.preserve_times {
            self.dest
                .set_mtime(&record.path, record.mtime)
                .map_err(self.dst_err(&record.path))?;
        }
        if self.preserve_permissions {
            self.dest
                .set_permissions(&record.path, record.permissions)
                .map_err(self.dst_err(&record.path))?;
        }
        Ok(())
    }
}
