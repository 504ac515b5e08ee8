//! Splitting files into transfer tasks.

use serde::{Deserialize, Serialize};

/// Index of a file within a job's plan.
pub type FileId = usize;

/// What a task moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// The whole file, streamed sequentially.
    Whole,
    /// One range `[offset, offset + len)` of a chunked file.
    Chunk {
        /// Chunk index within the file.
        index: u32,
        /// Start offset.
        offset: u64,
        /// Length in bytes.
        len: u64,
    },
}

/// Unit of work for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTask {
    /// File the task belongs to.
    pub file: FileId,
    /// Whole file or chunk.
    pub kind: TaskKind,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Lower keys are scheduled first.
    pub order_key: u64,
}

impl TransferTask {
    /// Same task, next attempt.
    #[must_use]
    pub const fn retry(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }

    /// Bytes this task moves for a file of `file_size` bytes.
    #[must_use]
    pub const fn len(&self, file_size: u64) -> u64 {
        match self.kind {
            TaskKind::Whole => file_size,
            TaskKind::Chunk { len, .. } => len,
        }
    }
}

/// Chunk range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// Chunk index.
    pub index: u32,
    /// Start offset.
    pub offset: u64,
    /// Length; only the last chunk may be shorter than the chunk size.
    pub len: u64,
}

impl ChunkRange {
    /// Exclusive end offset.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Chunk length actually used for a file of `size` bytes: `chunk_size`,
/// raised where needed so the chunk count fits a `u32` index.
#[must_use]
#[allow(clippy::cast_lossless)]
pub const fn effective_chunk_size(size: u64, chunk_size: u64) -> u64 {
    let floor = size.div_ceil(u32::MAX as u64);
    let chunk_size = if chunk_size == 0 { 1 } else { chunk_size };
    if chunk_size < floor {
        floor
    } else {
        chunk_size
    }
}

/// Partition `[0, size)` into consecutive ranges of
/// [`effective_chunk_size`] bytes.
///
/// An empty file yields no ranges; `chunk_size` of 0 is treated as 1.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn split_ranges(size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let chunk_size = effective_chunk_size(size, chunk_size);
    let count = size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            ChunkRange {
                // count <= u32::MAX
                index: i as u32,
                offset,
                len: chunk_size.min(size - offset),
            }
        })
        .collect()
}

/// Decides whether and how files are chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    threshold: u64,
    chunk_size: u64,
}

impl ChunkPlanner {
    /// Files at or above `threshold` split into `chunk_size` ranges.
    #[must_use]
    pub const fn new(threshold: u64, chunk_size: u64) -> Self {
        Self {
            threshold,
            chunk_size,
        }
    }

    /// Configured chunk length.
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Chunk length used for a file of `size` bytes.
    #[must_use]
    pub const fn chunk_size_for(&self, size: u64) -> u64 {
        effective_chunk_size(size, self.chunk_size)
    }

    /// Whether a file of this size is chunked.
    #[must_use]
    pub const fn is_chunked(&self, size: u64) -> bool {
        size > 0 && size >= self.threshold
    }

    /// Ranges for a file, or empty when it is transferred whole.
    #[must_use]
    pub fn ranges(&self, size: u64) -> Vec<ChunkRange> {
        if self.is_chunked(size) {
            split_ranges(size, self.chunk_size)
        } else {
            Vec::new()
        }
    }

    /// Tasks for one file. `order_key` is shared by every chunk of the file
    /// so siblings stay adjacent in the queue.
    #[must_use]
    pub fn tasks(&self, file: FileId, size: u64, order_key: u64) -> Vec<TransferTask> {
        if !self.is_chunked(size) {
            return vec![TransferTask {
                file,
                kind: TaskKind::Whole,
                attempt: 0,
                order_key,
            }];
        }
        self.ranges(size)
            .into_iter()
            .map(|r| TransferTask {
                file,
                kind: TaskKind::Chunk {
                    index: r.index,
                    offset: r.offset,
                    len: r.len,
                },
                attempt: 0,
                order_key,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_truncates_final_chunk() {
        let ranges = split_ranges(250, 100);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[2], ChunkRange { index: 2, offset: 200, len: 50 });
    }

    #[test]
    fn split_exact_multiple() {
        let ranges = split_ranges(300, 100);
        assert_eq!(ranges.len(), 3);
        assert!(ranges.iter().all(|r| r.len == 100));
    }

    #[test]
    fn split_empty_file() {
        assert!(split_ranges(0, 100).is_empty());
    }

    #[test]
    fn planner_threshold_is_inclusive() {
        let planner = ChunkPlanner::new(1000, 300);
        assert!(!planner.is_chunked(999));
        assert!(planner.is_chunked(1000));
        assert_eq!(planner.tasks(0, 999, 0), vec![TransferTask {
            file: 0,
            kind: TaskKind::Whole,
            attempt: 0,
            order_key: 0,
        }]);
        assert_eq!(planner.tasks(1, 1000, 7).len(), 4);
    }

    #[test]
    fn empty_file_is_one_whole_task() {
        let planner = ChunkPlanner::new(0, 300);
        let tasks = planner.tasks(3, 0, 0);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::Whole);
    }

    #[test]
    fn chunk_count_never_exceeds_u32_indices() {
        let planner = ChunkPlanner::new(1, 1);
        assert_eq!(planner.chunk_size_for(10_000), 1);
        let size = u64::MAX - 7;
        let chunk = planner.chunk_size_for(size);
        assert!(chunk > 1);
        assert!(size.div_ceil(chunk) <= u64::from(u32::MAX));
        assert_eq!(effective_chunk_size(1 << 40, 0), 257);
        assert_eq!(effective_chunk_size(1 << 40, 1 << 20), 1 << 20);
    }

    #[test]
    fn retry_bumps_attempt_only() {
        let task = ChunkPlanner::new(10, 5).tasks(2, 12, 9)[1];
        let again = task.retry().retry();
        assert_eq!(again.attempt, 2);
        assert_eq!(again.kind, task.kind);
        assert_eq!(again.len(12), 5);
    }
}
