//! Replica writer: verified, durable appends to one block replica.
//!
//! A `ReplicaWriter` owns the data and meta files of one replica. Appends
//! are verified chunk by chunk before anything touches disk; a mismatch
//! rejects the whole append and leaves the replica unchanged. After the
//! bytes and checksums are written both files are fsynced, and only then
//! is the durable length advanced. The durable length is what the replica
//! reports back to the pipeline, so it must never run ahead of the disk.
//!
//! # Partial chunk rewrite
//!
//! When the durable length ends mid-chunk, the next append starts at that
//! chunk's aligned offset instead of at the durable length, and the chunk
//! and its checksum are overwritten in place. More generally an append may
//! start at any chunk boundary below the durable length (a retried flush
//! re-sends bytes some replicas already hold) as long as the overlapping
//! bytes match what is stored and the append does not end short of it.
//!
//! # Readers
//!
//! Readers take no file lock and never wait for an append's fsync. Each
//! append ends by publishing the durable length together with the checksum
//! of the trailing partial chunk, if any. A reader takes that snapshot,
//! reads the data file with its own handle, verifies full chunks against
//! the meta file (a full chunk's checksum never changes) and the partial
//! chunk against the in-memory checksum, since the on-disk one may already
//! belong to a longer chunk from an append still in progress.

use crate::checksum::DataChecksum;
use crate::chunker::{validate_chunks, Chunk};
use crate::format::{
    data_file_name, meta_file_name, BlockMetaHeader, BLOCK_META_HEADER_SIZE, CHECKSUM_SIZE,
};
use cascade_core::{CascadeError, CascadeResult, ExtendedBlock};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lifecycle of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Accepting appends
    Writing,
    /// Length fixed; appends are refused
    Finalized,
}

struct ReplicaFiles {
    data: File,
    meta: File,
    state: ReplicaState,
}

/// Durable length plus the checksum of the chunk it ends in, when short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DurableTail {
    length: u64,
    partial_checksum: Option<u32>,
}

impl DurableTail {
    const EMPTY: DurableTail = DurableTail {
        length: 0,
        partial_checksum: None,
    };
}

/// Per-replica sink for one block
pub struct ReplicaWriter {
    block: ExtendedBlock,
    checksum: DataChecksum,
    data_path: PathBuf,
    meta_path: PathBuf,
    /// Held by writers only
    files: RwLock<ReplicaFiles>,
    /// Bytes persisted and checksum-verified, published after the fsync
    tail: RwLock<DurableTail>,
}

impl ReplicaWriter {
    /// Create a new, empty replica in `dir`.
    ///
    /// Fails if a replica for the block already exists there.
    pub fn create(dir: &Path, block: ExtendedBlock, checksum: DataChecksum) -> CascadeResult<Self> {
        std::fs::create_dir_all(dir)?;
        let data_path = dir.join(data_file_name(block.id));
        let meta_path = dir.join(meta_file_name(&block));

        let data = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&data_path)?;
        let mut meta = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&meta_path)?;
        meta.write_all(&BlockMetaHeader::new(checksum).to_bytes())?;
        meta.sync_all()?;

        debug!(target: "cascade::replica", block = %block, "Replica created");

        Ok(ReplicaWriter {
            block,
            checksum,
            data_path,
            meta_path,
            files: RwLock::new(ReplicaFiles {
                data,
                meta,
                state: ReplicaState::Writing,
            }),
            tail: RwLock::new(DurableTail::EMPTY),
        })
    }

    /// Reopen an existing replica, recovering its durable length.
    ///
    /// The durable length is the longest prefix whose trailing chunk still
    /// verifies; a chunk torn by a crash mid-append is dropped.
    pub fn open(dir: &Path, block: ExtendedBlock) -> CascadeResult<Self> {
        let data_path = dir.join(data_file_name(block.id));
        let meta_path = dir.join(meta_file_name(&block));

        let mut data = OpenOptions::new().read(true).write(true).open(&data_path)?;
        let mut meta = OpenOptions::new().read(true).write(true).open(&meta_path)?;

        let mut header_bytes = [0u8; BLOCK_META_HEADER_SIZE];
        meta.read_exact(&mut header_bytes)?;
        let header = BlockMetaHeader::from_bytes(&header_bytes).map_err(|e| {
            CascadeError::corruption(block.id, 0, format!("meta header: {}", e))
        })?;
        let checksum = header.checksum;

        let data_len = data.metadata()?.len();
        let stored_sums = (meta.metadata()?.len() - BLOCK_META_HEADER_SIZE as u64)
            / CHECKSUM_SIZE as u64;
        let mut durable = data_len.min(stored_sums * checksum.chunk_len());
        let mut partial_checksum = None;

        while durable > 0 {
            let start = checksum.align_down(durable - 1);
            let mut chunk = vec![0u8; (durable - start) as usize];
            data.seek(SeekFrom::Start(start))?;
            data.read_exact(&mut chunk)?;
            let sum = read_checksum(&mut meta, start / checksum.chunk_len())?;
            if checksum.verify(&chunk, sum) {
                if !checksum.is_aligned(durable) {
                    partial_checksum = Some(sum);
                }
                break;
            }
            warn!(
                target: "cascade::replica",
                block = %block,
                offset = start,
                "Dropping torn trailing chunk during replica recovery"
            );
            durable = start;
        }

        debug!(target: "cascade::replica", block = %block, durable, "Replica reopened");

        Ok(ReplicaWriter {
            block,
            checksum,
            data_path,
            meta_path,
            files: RwLock::new(ReplicaFiles {
                data,
                meta,
                state: ReplicaState::Writing,
            }),
            tail: RwLock::new(DurableTail {
                length: durable,
                partial_checksum,
            }),
        })
    }

    /// Block this replica stores
    pub fn block(&self) -> ExtendedBlock {
        self.block
    }

    /// Checksum geometry of the replica
    pub fn checksum(&self) -> DataChecksum {
        self.checksum
    }

    /// Bytes persisted and verified so far
    pub fn durable_length(&self) -> u64 {
        self.tail.read().length
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReplicaState {
        self.files.read().state
    }

    /// Persist `chunks`, which start at block offset `offset`.
    ///
    /// Returns the new durable length. On a checksum mismatch the append is
    /// rejected with `CascadeError::Corruption` and nothing is written.
    pub fn append(&self, offset: u64, chunks: &[Chunk]) -> CascadeResult<u64> {
        let mut files = self.files.write();
        if files.state == ReplicaState::Finalized {
            return Err(CascadeError::invariant(format!(
                "append to finalized replica {}",
                self.block
            )));
        }
        let durable = self.durable_length();
        if chunks.is_empty() {
            return Ok(durable);
        }
        validate_chunks(offset, chunks, self.checksum.bytes_per_chunk())?;

        // Verify before touching disk so a bad append changes nothing.
        let mut end = offset;
        for chunk in chunks {
            if let Err(e) = self
                .checksum
                .verify_chunk(self.block.id, end, &chunk.data, chunk.checksum)
            {
                warn!(
                    target: "cascade::replica",
                    block = %self.block,
                    offset = end,
                    "Rejecting append: checksum mismatch"
                );
                return Err(e);
            }
            end += chunk.len() as u64;
        }

        if offset > durable {
            return Err(CascadeError::invariant(format!(
                "append at {} leaves a gap after durable length {} in {}",
                offset, durable, self.block
            )));
        }
        if offset < durable {
            if end < durable {
                return Err(CascadeError::invariant(format!(
                    "append ending at {} would shrink durable length {} in {}",
                    end, durable, self.block
                )));
            }
            let mut existing = vec![0u8; (durable - offset) as usize];
            files.data.seek(SeekFrom::Start(offset))?;
            files.data.read_exact(&mut existing)?;
            let incoming = chunks.iter().flat_map(|c| c.data.iter());
            if !existing.iter().eq(incoming.take(existing.len())) {
                return Err(CascadeError::invariant(format!(
                    "append at {} overwrites durable bytes up to {} in {}",
                    offset, durable, self.block
                )));
            }
        }

        files.data.seek(SeekFrom::Start(offset))?;
        for chunk in chunks {
            files.data.write_all(&chunk.data)?;
        }
        let first_index = offset / self.checksum.chunk_len();
        files
            .meta
            .seek(SeekFrom::Start(BlockMetaHeader::checksum_position(first_index)))?;
        let mut sums = Vec::with_capacity(chunks.len() * CHECKSUM_SIZE);
        for chunk in chunks {
            sums.extend_from_slice(&chunk.checksum.to_le_bytes());
        }
        files.meta.write_all(&sums)?;

        files.data.sync_data()?;
        files.meta.sync_data()?;
        let partial_checksum = chunks
            .last()
            .filter(|_| !self.checksum.is_aligned(end))
            .map(|c| c.checksum);
        *self.tail.write() = DurableTail {
            length: end,
            partial_checksum,
        };

        debug!(
            target: "cascade::replica",
            block = %self.block,
            offset,
            durable = end,
            chunks = chunks.len(),
            "Replica append persisted"
        );
        Ok(end)
    }

    /// Force everything written to stable storage; returns the durable length.
    pub fn flush(&self) -> CascadeResult<u64> {
        let files = self.files.write();
        files.data.sync_all()?;
        files.meta.sync_all()?;
        Ok(self.durable_length())
    }

    /// Fix the replica's length and refuse further appends.
    ///
    /// Idempotent for the same length.
    pub fn finalize(&self, length: u64) -> CascadeResult<u64> {
        let mut files = self.files.write();
        let durable = self.durable_length();
        if durable != length {
            return Err(CascadeError::invariant(format!(
                "finalize {} at {} but durable length is {}",
                self.block, length, durable
            )));
        }
        if files.state == ReplicaState::Writing {
            files.data.sync_all()?;
            files.meta.sync_all()?;
            files.state = ReplicaState::Finalized;
            debug!(target: "cascade::replica", block = %self.block, length, "Replica finalized");
        }
        Ok(durable)
    }

    /// Read up to `len` bytes at `offset`, verifying every chunk touched.
    ///
    /// Reads stop at the durable length; a read starting at or beyond it
    /// returns no bytes. Never waits for an append in progress.
    pub fn read(&self, offset: u64, len: u64) -> CascadeResult<Vec<u8>> {
        let tail = *self.tail.read();
        let durable = tail.length;
        let end = offset.saturating_add(len).min(durable);
        if offset >= end {
            return Ok(Vec::new());
        }

        let span_start = self.checksum.align_down(offset);
        let span_end = self.checksum.align_up(end).min(durable);
        let mut span = vec![0u8; (span_end - span_start) as usize];
        let mut data = File::open(&self.data_path)?;
        data.seek(SeekFrom::Start(span_start))?;
        data.read_exact(&mut span)?;

        let chunk_len = self.checksum.bytes_per_chunk() as usize;
        let first_index = span_start / self.checksum.chunk_len();
        let chunk_count = (span.len() + chunk_len - 1) / chunk_len;
        let mut sums = vec![0u8; chunk_count * CHECKSUM_SIZE];
        let mut meta = File::open(&self.meta_path)?;
        meta.seek(SeekFrom::Start(BlockMetaHeader::checksum_position(first_index)))?;
        meta.read_exact(&mut sums)?;

        for (i, piece) in span.chunks(chunk_len).enumerate() {
            let at = i * CHECKSUM_SIZE;
            let stored = match tail.partial_checksum {
                Some(sum) if piece.len() < chunk_len => sum,
                _ => u32::from_le_bytes([sums[at], sums[at + 1], sums[at + 2], sums[at + 3]]),
            };
            self.checksum.verify_chunk(
                self.block.id,
                span_start + (i * chunk_len) as u64,
                piece,
                stored,
            )?;
        }

        let from = (offset - span_start) as usize;
        let to = (end - span_start) as usize;
        Ok(span[from..to].to_vec())
    }

    /// Path of the data file
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Path of the meta file
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }
}

fn read_checksum(meta: &mut File, index: u64) -> CascadeResult<u32> {
    let mut buf = [0u8; CHECKSUM_SIZE];
    meta.seek(SeekFrom::Start(BlockMetaHeader::checksum_position(index)))?;
    meta.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

impl std::fmt::Debug for ReplicaWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaWriter")
            .field("block", &self.block)
            .field("checksum", &self.checksum)
            .field("durable_length", &self.durable_length())
            .finish()
    }
}
