//! Async delta operations using tokio.
//!
//! Mirrors the blocking [`DeltaEngine`] for callers already running on a
//! tokio runtime, plus an async wait on the [`TokenBucket`].

#[cfg(feature = "async")]
use std::path::Path;

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::delta::DeltaEngine;
#[cfg(feature = "async")]
use crate::delta::{Delta, DeltaOp};
#[cfg(feature = "async")]
use crate::error::SyncError;
use crate::error::Result;
#[cfg(feature = "async")]
use crate::executor::{DeltaOutcome, STAGING_SUFFIX};
#[cfg(feature = "async")]
use crate::hash::{ContentHasher, StrongHash};
#[cfg(feature = "async")]
use crate::signature::{ChunkSignature, SignatureTable};
#[cfg(feature = "async")]
use crate::throttle::TokenBucket;

/// Async front end to [`DeltaEngine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncDeltaEngine {
    engine: DeltaEngine,
}

impl AsyncDeltaEngine {
    /// Engine with the given block size.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::InvalidBlockSize`] for an invalid size.
    pub fn new(block_size: usize) -> Result<Self> {
        Ok(Self {
            engine: DeltaEngine::new(block_size)?,
        })
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.engine.block_size()
    }

    /// Sign an async basis stream.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    #[cfg(feature = "async")]
    pub async fn signature<R>(&self, mut reader: R) -> Result<SignatureTable>
    where
        R: AsyncRead + Unpin,
    {
        let block_size = self.block_size();
        let mut blocks = Vec::new();
        let mut buffer = vec![0u8; block_size];
        let mut offset = 0u64;

        loop {
            let mut filled = 0;
            while filled < block_size {
                match reader.read(&mut buffer[filled..]).await? {
                    0 => break,
                    n => filled += n,
                }
            }
            if filled == 0 {
                break;
            }
            blocks.push(ChunkSignature::compute(offset, &buffer[..filled]));
            offset += filled as u64;
            if filled < block_size {
                break;
            }
        }

        Ok(SignatureTable::from_blocks(block_size, offset, blocks))
    }

    /// Compute a delta from an async source.
    ///
    /// The source is buffered in memory and matched on a blocking thread.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    #[cfg(feature = "async")]
    pub async fn delta<R>(&self, mut source: R, table: &SignatureTable) -> Result<Delta>
    where
        R: AsyncRead + Unpin,
    {
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        let engine = self.engine;
        let table = table.clone();
        tokio::task::spawn_blocking(move || engine.delta(&mut data.as_slice(), &table))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }

    /// Rebuild the source from `basis` into `output`, checking the result hash.
    ///
    /// # Errors
    ///
    /// Invalid copy bounds, a hash mismatch, or I/O failure.
    #[cfg(feature = "async")]
    pub async fn patch<R, W>(&self, mut basis: R, delta: &Delta, mut output: W) -> Result<()>
    where
        R: AsyncRead + AsyncSeek + Unpin,
        W: AsyncWrite + Unpin,
    {
        delta.validate()?;
        let mut hasher = ContentHasher::new();
        let mut buffer = Vec::new();

        for op in &delta.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    buffer.resize(*len as usize, 0);
                    basis.seek(std::io::SeekFrom::Start(*offset)).await?;
                    basis.read_exact(&mut buffer).await?;
                    output.write_all(&buffer).await?;
                    hasher.update(&buffer);
                }
                DeltaOp::Literal(data) => {
                    output.write_all(data).await?;
                    hasher.update(data);
                }
            }
        }
        output.flush().await?;

        let actual = hasher.finalize();
        if actual != delta.checksum {
            return Err(SyncError::VerificationMismatch {
                path: std::path::PathBuf::new(),
                expected: delta.checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }

    /// Bring `dest_path` up to date with `source_path`.
    ///
    /// Without a destination the source is copied whole. Otherwise the new
    /// content is staged beside the destination and renamed over it.
    ///
    /// # Errors
    ///
    /// Any I/O failure or a hash mismatch of the rebuilt file.
    #[cfg(feature = "async")]
    pub async fn sync_file<P1, P2>(&self, source_path: P1, dest_path: P2) -> Result<DeltaOutcome>
    where
        P1: AsRef<Path>,
        P2: AsRef<Path>,
    {
        let source_path = source_path.as_ref();
        let dest_path = dest_path.as_ref();

        if !tokio::fs::try_exists(dest_path).await.unwrap_or(false) {
            let data = tokio::fs::read(source_path).await?;
            tokio::fs::write(dest_path, &data).await?;
            return Ok(DeltaOutcome {
                hash: StrongHash::compute(&data),
                size: data.len() as u64,
                bytes_matched: 0,
                bytes_literal: data.len() as u64,
            });
        }

        let basis = tokio::fs::File::open(dest_path).await?;
        let table = self.signature(basis).await?;
        let source = tokio::fs::File::open(source_path).await?;
        let delta = self.delta(source, &table).await?;

        let mut staging = dest_path.as_os_str().to_owned();
        staging.push(STAGING_SUFFIX);
        let staging = std::path::PathBuf::from(staging);

        let result = async {
            let basis = tokio::fs::File::open(dest_path).await?;
            let output = tokio::fs::File::create(&staging).await?;
            self.patch(basis, &delta, output).await?;
            tokio::fs::rename(&staging, dest_path).await?;
            Ok::<(), SyncError>(())
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }

        Ok(DeltaOutcome {
            hash: delta.checksum,
            size: delta.source_size,
            bytes_matched: delta.bytes_matched(),
            bytes_literal: delta.bytes_literal(),
        })
    }
}

#[cfg(feature = "async")]
impl TokenBucket {
    /// Wait without blocking the runtime until `bytes` tokens were deducted.
    pub async fn acquire_async(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            if self.rate() == 0 {
                return;
            }
            let step = remaining.min(self.capacity());
            match self.poll_acquire(step) {
                None => remaining -= step,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
