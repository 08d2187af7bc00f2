//! Per-chunk checksums
//!
//! A `DataChecksum` pairs an algorithm with a chunk size. The chunk size is
//! fixed for the lifetime of a block and is recorded in the block's meta
//! file header so readers verify with the same geometry the writer used.

use cascade_core::{BlockId, CascadeError, CascadeResult, ChecksumKind};

/// Checksum algorithm plus chunk geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChecksum {
    kind: ChecksumKind,
    bytes_per_chunk: u32,
}

impl DataChecksum {
    /// Create a new checksum descriptor.
    ///
    /// Returns an invariant violation for a zero chunk size.
    pub fn new(kind: ChecksumKind, bytes_per_chunk: u32) -> CascadeResult<Self> {
        if bytes_per_chunk == 0 {
            return Err(CascadeError::invariant("bytes_per_chunk must be non-zero"));
        }
        Ok(DataChecksum {
            kind,
            bytes_per_chunk,
        })
    }

    /// CRC32 with the given chunk size
    pub fn crc32(bytes_per_chunk: u32) -> CascadeResult<Self> {
        Self::new(ChecksumKind::Crc32, bytes_per_chunk)
    }

    /// Algorithm
    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    /// Chunk size in bytes
    pub fn bytes_per_chunk(&self) -> u32 {
        self.bytes_per_chunk
    }

    /// Chunk size as a `u64`, for offset arithmetic
    pub fn chunk_len(&self) -> u64 {
        self.bytes_per_chunk as u64
    }

    /// Compute the checksum of one chunk.
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self.kind {
            ChecksumKind::Null => 0,
            ChecksumKind::Crc32 => crc32fast::hash(data),
            ChecksumKind::Xxh3 => xxhash_rust::xxh3::xxh3_64(data) as u32,
        }
    }

    /// Check one chunk against its stored checksum.
    pub fn verify(&self, data: &[u8], checksum: u32) -> bool {
        match self.kind {
            ChecksumKind::Null => true,
            _ => self.compute(data) == checksum,
        }
    }

    /// Check one chunk, reporting a mismatch as `CascadeError::Corruption`.
    pub fn verify_chunk(
        &self,
        block_id: BlockId,
        offset: u64,
        data: &[u8],
        checksum: u32,
    ) -> CascadeResult<()> {
        if self.verify(data, checksum) {
            Ok(())
        } else {
            Err(CascadeError::corruption(
                block_id,
                offset,
                format!(
                    "{} mismatch over {} bytes: stored {:#010x}, computed {:#010x}",
                    self.kind.name(),
                    data.len(),
                    checksum,
                    self.compute(data)
                ),
            ))
        }
    }

    /// Round a block offset down to the start of its chunk.
    pub fn align_down(&self, offset: u64) -> u64 {
        offset - offset % self.chunk_len()
    }

    /// Round a block offset up to the next chunk boundary.
    pub fn align_up(&self, offset: u64) -> u64 {
        let rem = offset % self.chunk_len();
        if rem == 0 {
            offset
        } else {
            offset + (self.chunk_len() - rem)
        }
    }

    /// Whether `offset` sits on a chunk boundary.
    pub fn is_aligned(&self, offset: u64) -> bool {
        offset % self.chunk_len() == 0
    }
}
