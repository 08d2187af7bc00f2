//! Checksum chunking with a carried partial chunk
//!
//! Block data is verified in fixed-size chunks measured from the start of
//! the block. A flush can end anywhere, so the last chunk it sends may be
//! short. That short chunk is remembered in the chunker's carry buffer: the
//! next flush starts again at the chunk's aligned offset, re-sends the
//! carried bytes followed by the new ones, and the replica overwrites the
//! short chunk with the longer one.
//!
//! # Two-phase use
//!
//! ```text
//! let batch = chunker.chunk(&unflushed)?;   // pure: carry is untouched
//! pipeline.flush(&batch)?;                  // may fail; retry with same bytes
//! chunker.commit(&batch)?;                  // only after every ack
//! ```
//!
//! Keeping `chunk` pure means a failed flush leaves the chunker exactly as
//! it was, and a retry produces the same batch.

use crate::checksum::DataChecksum;
use cascade_core::{CascadeError, CascadeResult};

/// One verification chunk: raw bytes plus their checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk bytes (at most `bytes_per_chunk`)
    pub data: Vec<u8>,
    /// Checksum of `data`
    pub checksum: u32,
}

impl Chunk {
    /// Build a chunk, computing its checksum.
    pub fn new(checksum: &DataChecksum, data: Vec<u8>) -> Self {
        let sum = checksum.compute(&data);
        Chunk {
            data,
            checksum: sum,
        }
    }

    /// Number of data bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk carries no data
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An ordered run of chunks starting at a chunk-aligned block offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBatch {
    /// Block offset of the first chunk's first byte
    pub start_offset: u64,
    /// Chunks in block order
    pub chunks: Vec<Chunk>,
}

impl ChunkBatch {
    /// A batch with no chunks at `start_offset`
    pub fn empty(start_offset: u64) -> Self {
        ChunkBatch {
            start_offset,
            chunks: Vec::new(),
        }
    }

    /// Total data bytes in the batch
    pub fn payload_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    /// Block offset one past the batch's last byte
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.payload_len()
    }

    /// Whether the batch carries no chunks
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether the batch ends with a short chunk
    pub fn ends_partial(&self, bytes_per_chunk: u32) -> bool {
        self.chunks
            .last()
            .map(|c| c.len() < bytes_per_chunk as usize)
            .unwrap_or(false)
    }

    /// Check chunk geometry; see [`validate_chunks`].
    pub fn validate(&self, bytes_per_chunk: u32) -> CascadeResult<()> {
        validate_chunks(self.start_offset, &self.chunks, bytes_per_chunk)
    }

    /// Split into consecutive batches of at most `max_bytes` payload each.
    ///
    /// Splits fall on chunk boundaries; every piece holds at least one chunk.
    pub fn split(&self, max_bytes: u64) -> Vec<ChunkBatch> {
        if self.chunks.is_empty() {
            return vec![self.clone()];
        }
        let mut pieces = Vec::new();
        let mut current = ChunkBatch::empty(self.start_offset);
        for chunk in &self.chunks {
            if !current.is_empty() && current.payload_len() + chunk.len() as u64 > max_bytes {
                let next_start = current.end_offset();
                pieces.push(std::mem::replace(&mut current, ChunkBatch::empty(next_start)));
            }
            current.chunks.push(chunk.clone());
        }
        pieces.push(current);
        pieces
    }
}

/// Check chunk geometry.
///
/// The start must be chunk-aligned, no chunk may be empty or longer than
/// `bytes_per_chunk`, and only the last chunk may be short.
pub fn validate_chunks(start_offset: u64, chunks: &[Chunk], bytes_per_chunk: u32) -> CascadeResult<()> {
    let chunk_len = bytes_per_chunk as usize;
    if start_offset % bytes_per_chunk as u64 != 0 {
        return Err(CascadeError::invariant(format!(
            "batch start {} is not aligned to chunk size {}",
            start_offset, bytes_per_chunk
        )));
    }
    let last = chunks.len().saturating_sub(1);
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.is_empty() || chunk.len() > chunk_len {
            return Err(CascadeError::invariant(format!(
                "chunk {} has length {} (chunk size {})",
                i,
                chunk.len(),
                bytes_per_chunk
            )));
        }
        if i < last && chunk.len() < chunk_len {
            return Err(CascadeError::invariant(format!(
                "short chunk {} of length {} is followed by more data",
                i,
                chunk.len()
            )));
        }
    }
    Ok(())
}

/// Splits block data into checksummed chunks, carrying a partial chunk
/// across flushes.
#[derive(Debug, Clone)]
pub struct ChecksumChunker {
    checksum: DataChecksum,
    /// Block offset of `carry[0]`; always chunk-aligned
    carry_offset: u64,
    /// Bytes of the trailing short chunk already accepted by the pipeline
    carry: Vec<u8>,
}

impl ChecksumChunker {
    /// Chunker for a fresh, empty block
    pub fn new(checksum: DataChecksum) -> Self {
        ChecksumChunker {
            checksum,
            carry_offset: 0,
            carry: Vec::new(),
        }
    }

    /// Checksum descriptor
    pub fn checksum(&self) -> &DataChecksum {
        &self.checksum
    }

    /// Bytes of the carried partial chunk
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Block offset of the carried partial chunk
    pub fn carry_offset(&self) -> u64 {
        self.carry_offset
    }

    /// Block offset up to which data has been committed
    pub fn committed_offset(&self) -> u64 {
        self.carry_offset + self.carry.len() as u64
    }

    /// Chunk `data`, which continues the block at `committed_offset()`.
    ///
    /// The returned batch starts at the carried chunk's aligned offset and
    /// includes the carried bytes. Does not modify the chunker.
    pub fn chunk(&self, data: &[u8]) -> CascadeResult<ChunkBatch> {
        let chunk_len = self.checksum.bytes_per_chunk() as usize;
        let mut batch = ChunkBatch::empty(self.carry_offset);
        if data.is_empty() && self.carry.is_empty() {
            return Ok(batch);
        }

        // The carried bytes fill the head of the first chunk.
        let mut head = self.carry.clone();
        let take = (chunk_len - head.len()).min(data.len());
        head.extend_from_slice(&data[..take]);
        batch.chunks.push(Chunk::new(&self.checksum, head));

        for piece in data[take..].chunks(chunk_len) {
            batch.chunks.push(Chunk::new(&self.checksum, piece.to_vec()));
        }

        batch.validate(self.checksum.bytes_per_chunk())?;
        Ok(batch)
    }

    /// Chunk `length` bytes of `bytes` starting at `offset`.
    pub fn chunk_range(&self, bytes: &[u8], offset: usize, length: usize) -> CascadeResult<ChunkBatch> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                CascadeError::invariant(format!(
                    "range {}+{} outside buffer of {} bytes",
                    offset,
                    length,
                    bytes.len()
                ))
            })?;
        self.chunk(&bytes[offset..end])
    }

    /// Record that `batch` was acknowledged by the pipeline.
    ///
    /// The batch must be the one `chunk` produced against the current carry;
    /// anything else is an invariant violation.
    pub fn commit(&mut self, batch: &ChunkBatch) -> CascadeResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.start_offset != self.carry_offset {
            return Err(CascadeError::invariant(format!(
                "committing batch at {} but carry starts at {}",
                batch.start_offset, self.carry_offset
            )));
        }
        batch.validate(self.checksum.bytes_per_chunk())?;

        let end = batch.end_offset();
        if end < self.committed_offset() {
            return Err(CascadeError::invariant(format!(
                "batch ending at {} would shrink committed offset {}",
                end,
                self.committed_offset()
            )));
        }

        match batch.chunks.last() {
            Some(last) if batch.ends_partial(self.checksum.bytes_per_chunk()) => {
                self.carry = last.data.clone();
                self.carry_offset = end - last.len() as u64;
            }
            _ => {
                self.carry.clear();
                self.carry_offset = end;
            }
        }
        Ok(())
    }

    /// Verify a chunk against its own checksum.
    pub fn verify(&self, chunk: &Chunk) -> bool {
        self.checksum.verify(&chunk.data, chunk.checksum)
    }
}
