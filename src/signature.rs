//! Block signatures of existing destination content.
//!
//! One [`ChunkSignature`] row per fixed-size block: a weak rolling checksum for
//! cheap candidate filtering and a BLAKE3 hash to confirm. The table indexes
//! rows by weak checksum so the delta engine can probe every source offset.

use std::io::Read;

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::checksum::RollingChecksum;
use crate::error::{Result, SyncError};
use crate::hash::StrongHash;

/// Smallest accepted delta block size.
pub const MIN_BLOCK_SIZE: usize = 512;
/// Largest accepted delta block size.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;
/// Default delta block size.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Blocks hashed per parallel batch while streaming.
const BLOCKS_PER_BATCH: usize = 64;

/// Signature of one block of the basis file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSignature {
    /// Byte offset of the block in the basis.
    pub offset: u64,
    /// Block length; only the final block may be shorter than the block size.
    pub len: u32,
    /// Rolling checksum digest.
    pub weak: u32,
    /// BLAKE3 hash of the block.
    pub strong: StrongHash,
}

impl ChunkSignature {
    /// Compute the signature of `data` located at `offset`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn compute(offset: u64, data: &[u8]) -> Self {
        Self {
            offset,
            len: data.len() as u32,
            weak: RollingChecksum::new(data).digest(),
            strong: StrongHash::compute(data),
        }
    }
}

/// Ordered block signatures plus a weak-checksum index.
///
/// Serializes as the block size, file size and row list; the index is rebuilt
/// on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SignatureRows", into = "SignatureRows")]
pub struct SignatureTable {
    block_size: usize,
    file_size: u64,
    blocks: Vec<ChunkSignature>,
    weak_index: FxHashMap<u32, Vec<usize>>,
}

#[derive(Serialize, Deserialize)]
struct SignatureRows {
    block_size: usize,
    file_size: u64,
    blocks: Vec<ChunkSignature>,
}

impl From<SignatureRows> for SignatureTable {
    fn from(rows: SignatureRows) -> Self {
        Self::from_blocks(rows.block_size, rows.file_size, rows.blocks)
    }
}

impl From<SignatureTable> for SignatureRows {
    fn from(table: SignatureTable) -> Self {
        Self {
            block_size: table.block_size,
            file_size: table.file_size,
            blocks: table.blocks,
        }
    }
}

impl PartialEq for SignatureTable {
    fn eq(&self, other: &Self) -> bool {
        self.block_size == other.block_size
            && self.file_size == other.file_size
            && self.blocks == other.blocks
    }
}

impl Eq for SignatureTable {}

impl SignatureTable {
    /// Build a table from precomputed rows.
    #[must_use]
    pub fn from_blocks(block_size: usize, file_size: u64, blocks: Vec<ChunkSignature>) -> Self {
        let mut weak_index: FxHashMap<u32, Vec<usize>> =
            FxHashMap::with_capacity_and_hasher(blocks.len(), rustc_hash::FxBuildHasher);
        for (i, block) in blocks.iter().enumerate() {
            weak_index.entry(block.weak).or_default().push(i);
        }
        Self {
            block_size,
            file_size,
            blocks,
            weak_index,
        }
    }

    /// Sign everything `reader` yields.
    ///
    /// The reader is consumed in batches of blocks and each batch is hashed in
    /// parallel, so memory stays bounded by the batch regardless of file size.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidBlockSize`] for an out-of-range block size
    /// and an I/O error if reading fails.
    pub fn generate<R: Read>(reader: &mut R, block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;

        let mut blocks = Vec::new();
        let mut batch = vec![0u8; block_size * BLOCKS_PER_BATCH];
        let mut offset = 0u64;

        loop {
            let filled = read_full(reader, &mut batch)?;
            if filled == 0 {
                break;
            }
            let base = offset;
            let rows: Vec<ChunkSignature> = batch[..filled]
                .par_chunks(block_size)
                .enumerate()
                .map(|(i, data)| ChunkSignature::compute(base + (i * block_size) as u64, data))
                .collect();
            blocks.extend(rows);
            offset += filled as u64;
            if filled < batch.len() {
                break;
            }
        }

        Ok(Self::from_blocks(block_size, offset, blocks))
    }

    /// Sign an in-memory buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidBlockSize`] for an out-of-range block size.
    pub fn from_slice(data: &[u8], block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;
        let blocks = data
            .par_chunks(block_size)
            .enumerate()
            .map(|(i, chunk)| ChunkSignature::compute((i * block_size) as u64, chunk))
            .collect();
        Ok(Self::from_blocks(block_size, data.len() as u64, blocks))
    }

    /// Find a full-size block whose weak and strong hashes match `data`.
    ///
    /// The strong hash is only computed when the weak index has candidates.
    #[must_use]
    pub fn find_match(&self, weak: u32, data: &[u8]) -> Option<&ChunkSignature> {
        let candidates = self.weak_index.get(&weak)?;
        let strong = StrongHash::compute(data);
        candidates
            .iter()
            .map(|&i| &self.blocks[i])
            .find(|sig| sig.len as usize == data.len() && sig.strong == strong)
    }

    /// Whether any block has this weak checksum.
    #[must_use]
    pub fn has_weak_match(&self, weak: u32) -> bool {
        self.weak_index.contains_key(&weak)
    }

    /// Rows in file order.
    #[must_use]
    pub fn blocks(&self) -> &[ChunkSignature] {
        &self.blocks
    }

    /// Block size used for generation.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Size of the signed file.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the signed file was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Check that a delta block size is a power of two within bounds.
///
/// # Errors
///
/// Returns [`SyncError::InvalidBlockSize`] otherwise.
pub fn validate_block_size(block_size: usize) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || !block_size.is_power_of_two() {
        return Err(SyncError::InvalidBlockSize(block_size));
    }
    Ok(())
}

/// Fill `buf` as far as the reader allows; returns bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // ==========================================================================
    // CHUNK SIGNATURE
    // ==========================================================================

    #[test]
    fn chunk_signature_compute() {
        let data = b"test block data";
        let sig = ChunkSignature::compute(4096, data);
        assert_eq!(sig.offset, 4096);
        assert_eq!(sig.len as usize, data.len());
        assert_eq!(sig.weak, RollingChecksum::new(data).digest());
        assert_eq!(sig.strong, StrongHash::compute(data));
    }

    // ==========================================================================
    // GENERATION
    // ==========================================================================

    #[test]
    fn generate_empty() {
        let table = SignatureTable::generate(&mut Cursor::new(Vec::new()), 1024).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.file_size(), 0);
    }

    #[test]
    fn generate_offsets_and_short_tail() {
        let data = vec![7u8; 3000];
        let table = SignatureTable::generate(&mut Cursor::new(&data), 1024).unwrap();
        let offsets: Vec<u64> = table.blocks().iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 1024, 2048]);
        assert_eq!(table.blocks()[2].len, 952);
        assert_eq!(table.file_size(), 3000);
    }

    #[test]
    fn generate_spanning_batches_matches_from_slice() {
        let data: Vec<u8> = (0..(512 * BLOCKS_PER_BATCH * 2 + 300))
            .map(|i| (i % 251) as u8)
            .collect();
        let streamed = SignatureTable::generate(&mut Cursor::new(&data), 512).unwrap();
        let direct = SignatureTable::from_slice(&data, 512).unwrap();
        assert_eq!(streamed, direct);
        assert_eq!(streamed.block_count(), data.len().div_ceil(512));
    }

    #[test]
    fn generate_rejects_bad_block_size() {
        let err = SignatureTable::generate(&mut Cursor::new(vec![1u8; 10]), 1000).unwrap_err();
        assert!(matches!(err, SyncError::InvalidBlockSize(1000)));
    }

    #[test]
    fn generate_propagates_read_error() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
            }
        }
        assert!(matches!(
            SignatureTable::generate(&mut Failing, 512),
            Err(SyncError::Io(_))
        ));
    }

    // ==========================================================================
    // LOOKUP
    // ==========================================================================

    #[test]
    fn find_match_exists_and_missing() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 200) as u8).collect();
        let table = SignatureTable::from_slice(&data, 1024).unwrap();

        let second = &data[1024..];
        let weak = RollingChecksum::new(second).digest();
        assert_eq!(table.find_match(weak, second).map(|s| s.offset), Some(1024));

        let other = vec![9u8; 1024];
        let weak = RollingChecksum::new(&other).digest();
        assert!(table.find_match(weak, &other).is_none());
    }

    #[test]
    fn duplicate_blocks_share_bucket() {
        let table = SignatureTable::from_slice(&[0u8; 2048], 1024).unwrap();
        assert!(table.has_weak_match(0));
        assert!(table.find_match(0, &[0u8; 1024]).is_some());
    }

    #[test]
    fn validate_block_size_bounds() {
        assert!(validate_block_size(512).is_ok());
        assert!(validate_block_size(DEFAULT_BLOCK_SIZE).is_ok());
        assert!(validate_block_size(MAX_BLOCK_SIZE).is_ok());
        assert!(validate_block_size(256).is_err());
        assert!(validate_block_size(MAX_BLOCK_SIZE * 2).is_err());
        assert!(validate_block_size(1025).is_err());
    }

    #[test]
    fn table_serde_rebuilds_index() {
        let data = vec![3u8; 5000];
        let table = SignatureTable::from_slice(&data, 1024).unwrap();
        let bytes = bincode::serialize(&table).unwrap();
        let restored: SignatureTable = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, table);
        let weak = RollingChecksum::new(&data[..1024]).digest();
        assert!(restored.has_weak_match(weak));
    }
}
