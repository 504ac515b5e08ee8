//! Delta computation and application.
//!
//! A delta rebuilds the source from the existing destination (the basis) as a
//! sequence of copy and literal instructions. [`DeltaEngine::stream`] reads
//! the source once through a window of two blocks and hands each instruction
//! to a callback, so memory is bounded by the block size plus the pending
//! literal run.

use std::io::{Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::checksum::RollingChecksum;
use crate::error::{Result, SyncError};
use crate::hash::{ContentHasher, StrongHash};
use crate::signature::{read_full, validate_block_size, SignatureTable, DEFAULT_BLOCK_SIZE};

/// Delta instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `len` bytes from the basis starting at `offset`.
    Copy {
        /// Byte offset in the basis file.
        offset: u64,
        /// Number of bytes to copy.
        len: u32,
    },
    /// Insert literal bytes.
    Literal(Vec<u8>),
}

impl DeltaOp {
    /// Copy instruction.
    #[must_use]
    pub const fn copy(offset: u64, len: u32) -> Self {
        Self::Copy { offset, len }
    }

    /// Whether this is a copy instruction.
    #[must_use]
    pub const fn is_copy(&self) -> bool {
        matches!(self, Self::Copy { .. })
    }

    /// Bytes this instruction contributes to the output.
    #[must_use]
    pub fn output_len(&self) -> u64 {
        match self {
            Self::Copy { len, .. } => u64::from(*len),
            Self::Literal(data) => data.len() as u64,
        }
    }
}

/// Collected delta for a whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Block size of the signature the delta was computed against.
    pub block_size: u32,
    /// Total size of the source.
    pub source_size: u64,
    /// Total size of the basis.
    pub basis_size: u64,
    /// Instructions in output order.
    pub ops: Vec<DeltaOp>,
    /// Hash of the expected output.
    pub checksum: StrongHash,
}

impl Delta {
    /// Empty delta.
    #[must_use]
    pub fn new(block_size: u32, source_size: u64, basis_size: u64) -> Self {
        Self {
            block_size,
            source_size,
            basis_size,
            ops: Vec::new(),
            checksum: StrongHash::zero(),
        }
    }

    /// Append a copy, merging with a contiguous previous copy.
    pub fn push_copy(&mut self, offset: u64, len: u32) {
        if let Some(DeltaOp::Copy {
            offset: prev_offset,
            len: prev_len,
        }) = self.ops.last_mut()
        {
            if *prev_offset + u64::from(*prev_len) == offset {
                if let Some(merged) = prev_len.checked_add(len) {
                    *prev_len = merged;
                    return;
                }
            }
        }
        self.ops.push(DeltaOp::copy(offset, len));
    }

    /// Append literal bytes, merging with a previous literal.
    pub fn push_literal(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(DeltaOp::Literal(prev)) = self.ops.last_mut() {
            prev.extend_from_slice(data);
            return;
        }
        self.ops.push(DeltaOp::Literal(data.to_vec()));
    }

    /// Append any instruction.
    pub fn push(&mut self, op: DeltaOp) {
        match op {
            DeltaOp::Copy { offset, len } => self.push_copy(offset, len),
            DeltaOp::Literal(data) => self.push_literal(&data),
        }
    }

    /// Bytes reused from the basis.
    #[must_use]
    pub fn bytes_matched(&self) -> u64 {
        self.ops
            .iter()
            .filter(|op| op.is_copy())
            .map(DeltaOp::output_len)
            .sum()
    }

    /// Bytes that must be transferred.
    #[must_use]
    pub fn bytes_literal(&self) -> u64 {
        self.ops
            .iter()
            .filter(|op| !op.is_copy())
            .map(DeltaOp::output_len)
            .sum()
    }

    /// Fraction of the source reused from the basis, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compression_ratio(&self) -> f64 {
        if self.source_size == 0 {
            return 1.0;
        }
        self.bytes_matched() as f64 / self.source_size as f64
    }

    /// Output size implied by the instructions.
    #[must_use]
    pub fn expected_output_size(&self) -> u64 {
        self.ops.iter().map(DeltaOp::output_len).sum()
    }

    /// Check every copy lies inside the basis.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidCopyBounds`] for the first offending copy.
    pub fn validate(&self) -> Result<()> {
        for op in &self.ops {
            if let DeltaOp::Copy { offset, len } = op {
                validate_copy(*offset, *len, self.basis_size)?;
            }
        }
        Ok(())
    }

    /// Rebuild the source from `basis` into `output`, checking the result hash.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidCopyBounds`] for a bad delta,
    /// [`SyncError::VerificationMismatch`] when the output hash differs, or an
    /// I/O error.
    pub fn apply<R: Read + Seek, W: Write>(&self, basis: &mut R, output: &mut W) -> Result<()> {
        self.validate()?;
        let mut hasher = ContentHasher::new();
        let mut buffer = Vec::new();
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    buffer.resize(*len as usize, 0);
                    basis.seek(SeekFrom::Start(*offset))?;
                    basis.read_exact(&mut buffer)?;
                    output.write_all(&buffer)?;
                    hasher.update(&buffer);
                }
                DeltaOp::Literal(data) => {
                    output.write_all(data)?;
                    hasher.update(data);
                }
            }
        }
        let actual = hasher.finalize();
        if actual != self.checksum {
            return Err(SyncError::VerificationMismatch {
                path: std::path::PathBuf::new(),
                expected: self.checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

/// Check a copy instruction against the basis size.
///
/// # Errors
///
/// Returns [`SyncError::InvalidCopyBounds`] when the copy runs past the end.
pub fn validate_copy(offset: u64, len: u32, basis_size: u64) -> Result<()> {
    if offset.saturating_add(u64::from(len)) > basis_size {
        return Err(SyncError::InvalidCopyBounds {
            offset,
            len,
            basis_size,
        });
    }
    Ok(())
}

/// Counters from one delta pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaStats {
    /// Copy instructions emitted.
    pub copy_ops: usize,
    /// Literal instructions emitted.
    pub literal_ops: usize,
    /// Bytes reused from the basis.
    pub bytes_matched: u64,
    /// Bytes emitted as literals.
    pub bytes_literal: u64,
    /// Source size.
    pub source_size: u64,
    /// Hash of the full source content.
    pub source_hash: StrongHash,
}

/// Streaming delta computation against a [`SignatureTable`].
///
/// # Example
///
/// ```rust
/// use chunksync::{DeltaEngine, SignatureTable};
///
/// let basis = vec![1u8; 4096];
/// let mut source = basis.clone();
/// source[100] = 2;
///
/// let table = SignatureTable::from_slice(&basis, 1024).unwrap();
/// let delta = DeltaEngine::new(1024).unwrap().delta(&mut source.as_slice(), &table).unwrap();
/// assert_eq!(delta.bytes_matched(), 3072);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DeltaEngine {
    block_size: usize,
    literal_limit: usize,
}

impl Default for DeltaEngine {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            literal_limit: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl DeltaEngine {
    /// Engine with the given block size; literal runs flush at one block.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidBlockSize`] for an out-of-range size.
    pub fn new(block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;
        Ok(Self {
            block_size,
            literal_limit: block_size,
        })
    }

    /// Cap on a single emitted literal instruction.
    #[must_use]
    pub fn with_literal_limit(mut self, limit: usize) -> Self {
        self.literal_limit = limit.max(1);
        self
    }

    /// Configured block size.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Sign the basis content.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn signature<R: Read>(&self, basis: &mut R) -> Result<SignatureTable> {
        SignatureTable::generate(basis, self.block_size)
    }

    /// Compute a delta and collect it in memory.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    #[allow(clippy::cast_possible_truncation)]
    pub fn delta<R: Read>(&self, source: &mut R, table: &SignatureTable) -> Result<Delta> {
        let mut delta = Delta::new(table.block_size() as u32, 0, table.file_size());
        let stats = self.stream(source, table, |op| {
            delta.push(op);
            Ok(())
        })?;
        delta.source_size = stats.source_size;
        delta.checksum = stats.source_hash;
        Ok(delta)
    }

    /// Compute a delta, handing each instruction to `emit` in output order.
    ///
    /// The source is hashed as it is read; the hash is returned in the stats.
    ///
    /// # Errors
    ///
    /// Propagates read failures and any error returned by `emit`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn stream<R, F>(&self, source: &mut R, table: &SignatureTable, mut emit: F) -> Result<DeltaStats>
    where
        R: Read,
        F: FnMut(DeltaOp) -> Result<()>,
    {
        let bs = table.block_size();
        let mut stats = DeltaStats::default();
        let mut hasher = ContentHasher::new();
        let mut buf: Vec<u8> = Vec::with_capacity(bs * 2);
        let mut start = 0usize;
        let mut eof = false;
        let mut rolling: Option<RollingChecksum> = None;
        let mut literal: Vec<u8> = Vec::new();

        if table.is_empty() {
            let mut chunk = vec![0u8; self.literal_limit];
            loop {
                let n = read_full(source, &mut chunk)?;
                if n == 0 {
                    break;
                }
                hasher.update(&chunk[..n]);
                stats.literal_ops += 1;
                stats.bytes_literal += n as u64;
                emit(DeltaOp::Literal(chunk[..n].to_vec()))?;
            }
            stats.source_size = hasher.bytes_hashed();
            stats.source_hash = hasher.finalize();
            return Ok(stats);
        }

        let flush_literal = |literal: &mut Vec<u8>, stats: &mut DeltaStats, emit: &mut F| {
            if literal.is_empty() {
                return Ok(());
            }
            stats.literal_ops += 1;
            stats.bytes_literal += literal.len() as u64;
            emit(DeltaOp::Literal(std::mem::take(literal)))
        };

        loop {
            if buf.len() - start <= bs && !eof {
                buf.drain(..start);
                start = 0;
                let old = buf.len();
                buf.resize(bs * 2, 0);
                let n = read_full(source, &mut buf[old..])?;
                buf.truncate(old + n);
                hasher.update(&buf[old..]);
                eof = old + n < bs * 2;
            }

            let avail = buf.len() - start;
            if avail < bs {
                break;
            }

            let window = &buf[start..start + bs];
            let digest = rolling.get_or_insert_with(|| RollingChecksum::new(window)).digest();
            if table.has_weak_match(digest) {
                if let Some(sig) = table.find_match(digest, window) {
                    flush_literal(&mut literal, &mut stats, &mut emit)?;
                    stats.copy_ops += 1;
                    stats.bytes_matched += u64::from(sig.len);
                    emit(DeltaOp::copy(sig.offset, sig.len))?;
                    start += bs;
                    rolling = None;
                    continue;
                }
            }

            let out = buf[start];
            literal.push(out);
            if literal.len() >= self.literal_limit {
                flush_literal(&mut literal, &mut stats, &mut emit)?;
            }
            match rolling.as_mut() {
                Some(rc) if avail > bs => rc.roll(out, buf[start + bs]),
                _ => rolling = None,
            }
            start += 1;
        }

        // Tail shorter than a block may still equal the basis's short final block.
        let tail = &buf[start..];
        if !tail.is_empty() {
            let digest = RollingChecksum::new(tail).digest();
            if let Some(sig) = table.find_match(digest, tail) {
                flush_literal(&mut literal, &mut stats, &mut emit)?;
                stats.copy_ops += 1;
                stats.bytes_matched += u64::from(sig.len);
                emit(DeltaOp::copy(sig.offset, sig.len))?;
            } else {
                let mut rest = tail;
                while !rest.is_empty() {
                    let take = (self.literal_limit - literal.len()).min(rest.len());
                    literal.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    if literal.len() >= self.literal_limit {
                        flush_literal(&mut literal, &mut stats, &mut emit)?;
                    }
                }
            }
        }
        flush_literal(&mut literal, &mut stats, &mut emit)?;

        stats.source_size = hasher.bytes_hashed();
        stats.source_hash = hasher.finalize();
        trace!(
            matched = stats.bytes_matched,
            literal = stats.bytes_literal,
            "delta computed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn patterned(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    fn roundtrip(basis: &[u8], source: &[u8], block_size: usize) -> Delta {
        let engine = DeltaEngine::new(block_size).unwrap();
        let table = engine.signature(&mut Cursor::new(basis)).unwrap();
        let delta = engine.delta(&mut Cursor::new(source), &table).unwrap();
        let mut out = Vec::new();
        delta.apply(&mut Cursor::new(basis), &mut out).unwrap();
        assert_eq!(out, source);
        delta
    }

    // ==========================================================================
    // DELTA OPS
    // ==========================================================================

    #[test]
    fn push_copy_merges_contiguous() {
        let mut delta = Delta::new(1024, 1000, 1000);
        delta.push_copy(0, 500);
        delta.push_copy(500, 200);
        delta.push_copy(900, 100);
        assert_eq!(delta.ops.len(), 2);
        assert_eq!(delta.bytes_matched(), 800);
    }

    #[test]
    fn push_literal_merges_and_ignores_empty() {
        let mut delta = Delta::new(1024, 100, 0);
        delta.push_literal(b"");
        delta.push_literal(b"hello");
        delta.push_literal(b" world");
        assert_eq!(delta.ops, vec![DeltaOp::Literal(b"hello world".to_vec())]);
    }

    #[test]
    fn validate_rejects_out_of_bounds_copy() {
        let mut delta = Delta::new(1024, 1000, 1000);
        delta.push_copy(900, 200);
        assert!(matches!(
            delta.validate(),
            Err(SyncError::InvalidCopyBounds { offset: 900, len: 200, basis_size: 1000 })
        ));
    }

    #[test]
    fn compression_ratio_partial() {
        let mut delta = Delta::new(1024, 1000, 1000);
        delta.push_copy(0, 500);
        delta.push_literal(&[0u8; 500]);
        assert!((delta.compression_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(delta.expected_output_size(), 1000);
    }

    // ==========================================================================
    // STREAMING ENGINE
    // ==========================================================================

    #[test]
    fn identical_content_is_all_copies() {
        let data = patterned(10_000, 1);
        let delta = roundtrip(&data, &data, 1024);
        assert_eq!(delta.bytes_literal(), 0);
        assert_eq!(delta.bytes_matched(), 10_000);
        assert_eq!(delta.ops.len(), 1);
    }

    #[test]
    fn empty_basis_is_all_literal() {
        let source = patterned(3000, 2);
        let delta = roundtrip(&[], &source, 512);
        assert_eq!(delta.bytes_literal(), 3000);
        assert_eq!(delta.bytes_matched(), 0);
    }

    #[test]
    fn empty_source_produces_no_ops() {
        let delta = roundtrip(&patterned(2048, 3), &[], 512);
        assert!(delta.ops.is_empty());
        assert_eq!(delta.checksum, StrongHash::compute(b""));
    }

    #[test]
    fn insertion_shifts_are_found() {
        let basis = patterned(8192, 4);
        let mut source = basis[..3000].to_vec();
        source.extend_from_slice(b"inserted bytes");
        source.extend_from_slice(&basis[3000..]);
        let delta = roundtrip(&basis, &source, 512);
        assert!(delta.bytes_matched() >= 8192 - 2 * 512);
    }

    #[test]
    fn modified_region_transfers_about_region_size() {
        let block = 1024;
        let basis = patterned(256 * block, 5);
        let mut source = basis.clone();
        let region = 100 * block + 17..120 * block + 17;
        for byte in &mut source[region.clone()] {
            *byte = byte.wrapping_add(1);
        }
        let delta = roundtrip(&basis, &source, block);
        let region_len = (region.end - region.start) as u64;
        assert!(delta.bytes_literal() >= region_len);
        assert!(delta.bytes_literal() <= region_len + block as u64);
    }

    #[test]
    fn literal_runs_are_capped() {
        let source = patterned(5000, 6);
        let engine = DeltaEngine::new(512).unwrap().with_literal_limit(700);
        let table = SignatureTable::from_slice(&[], 512).unwrap();
        let mut lens = Vec::new();
        let stats = engine
            .stream(&mut Cursor::new(&source), &table, |op| {
                lens.push(op.output_len());
                Ok(())
            })
            .unwrap();
        assert!(lens.iter().all(|&l| l <= 700));
        assert_eq!(lens.iter().sum::<u64>(), 5000);
        assert_eq!(stats.bytes_literal, 5000);
        assert_eq!(stats.source_hash, StrongHash::compute(&source));
    }

    #[test]
    fn short_final_block_is_matched() {
        let basis = patterned(2500, 7);
        let delta = roundtrip(&basis, &basis, 1024);
        assert_eq!(delta.bytes_literal(), 0);
    }

    #[test]
    fn emit_error_stops_stream() {
        let data = patterned(4096, 8);
        let engine = DeltaEngine::new(512).unwrap();
        let table = SignatureTable::from_slice(&data, 512).unwrap();
        let result = engine.stream(&mut Cursor::new(&data), &table, |_| Err(SyncError::Cancelled));
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[test]
    fn apply_detects_wrong_checksum() {
        let basis = patterned(2048, 9);
        let mut delta = DeltaEngine::new(512)
            .unwrap()
            .delta(
                &mut Cursor::new(&basis),
                &SignatureTable::from_slice(&basis, 512).unwrap(),
            )
            .unwrap();
        delta.checksum = StrongHash::zero();
        let err = delta.apply(&mut Cursor::new(&basis), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, SyncError::VerificationMismatch { .. }));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        /// Applying a delta always reproduces the source.
        #[test]
        fn apply_reproduces_source(
            basis in prop::collection::vec(any::<u8>(), 0..4000),
            source in prop::collection::vec(any::<u8>(), 0..4000),
        ) {
            let engine = DeltaEngine::new(512).unwrap();
            let table = engine.signature(&mut Cursor::new(&basis)).unwrap();
            let delta = engine.delta(&mut Cursor::new(&source), &table).unwrap();
            let mut out = Vec::new();
            delta.apply(&mut Cursor::new(&basis), &mut out).unwrap();
            prop_assert_eq!(out, source);
        }

        /// A source made of basis pieces reuses most of the basis.
        #[test]
        fn spliced_source_reuses_basis(
            basis in prop::collection::vec(any::<u8>(), 2048..6000),
            cut in 0usize..2048,
            insert in prop::collection::vec(any::<u8>(), 1..64),
        ) {
            let mut source = basis[..cut].to_vec();
            source.extend_from_slice(&insert);
            source.extend_from_slice(&basis[cut..]);
            let engine = DeltaEngine::new(512).unwrap();
            let table = engine.signature(&mut Cursor::new(&basis)).unwrap();
            let delta = engine.delta(&mut Cursor::new(&source), &table).unwrap();
            prop_assert_eq!(delta.bytes_matched() + delta.bytes_literal(), source.len() as u64);
            prop_assert!(delta.bytes_matched() + 3 * 512 >= basis.len() as u64);
        }
    }
}
