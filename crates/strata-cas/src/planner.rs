//! Storage strategy planning.
//!
//! Size policy: up to [`MAX_INLINE_SIZE`] the payload lives inside the
//! metadata row; up to [`CHUNK_SIZE`] it is one backend object; above that
//! it is split into fixed-size chunks, each content-addressed on its own.

use bytes::Bytes;

use strata_meta::StorageType;

/// Largest payload embedded directly in a metadata row (1 MiB).
pub const MAX_INLINE_SIZE: u64 = 1024 * 1024;

/// Fixed chunk size for large objects (5 MiB). Also the single-object
/// ceiling: anything larger is chunked.
pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Size-based storage strategy picker and chunk splitter.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    max_inline_size: u64,
    chunk_size: u64,
}

impl Default for ChunkPlanner {
    fn default() -> Self {
        Self {
            max_inline_size: MAX_INLINE_SIZE,
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl ChunkPlanner {
    /// Planner with custom thresholds. `chunk_size` must not be smaller
    /// than `max_inline_size`, otherwise the strategy ranges would overlap.
    pub fn new(max_inline_size: u64, chunk_size: u64) -> Self {
        assert!(
            chunk_size >= max_inline_size,
            "chunk_size must be >= max_inline_size"
        );
        assert!(chunk_size > 0, "chunk_size must be positive");
        Self {
            max_inline_size,
            chunk_size,
        }
    }

    pub fn max_inline_size(&self) -> u64 {
        self.max_inline_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Pick the storage strategy for a payload of `size` bytes.
    pub fn plan_storage(&self, size: u64) -> StorageType {
        if size <= self.max_inline_size {
            StorageType::Inline
        } else if size <= self.chunk_size {
            StorageType::Single
        } else {
            StorageType::Chunked
        }
    }

    /// Split `data` into ordered slices of at most `chunk_size` bytes.
    /// Concatenating the slices reproduces the input exactly; the final
    /// slice may be shorter.
    pub fn split_into_chunks<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        data.chunks(self.chunk_size as usize)
    }

    /// Concatenate chunk payloads in the order given. Exact inverse of
    /// [`Self::split_into_chunks`].
    pub fn reassemble(chunks: &[Bytes]) -> Bytes {
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in chunks {
            out.extend_from_slice(chunk);
        }
        Bytes::from(out)
    }
}
