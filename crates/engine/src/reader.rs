//! Read path bounded by visible length.
//!
//! A reader resolves the file's blocks on every call, so blocks allocated
//! after it was opened are picked up. Sealed blocks are readable up to
//! their final length. The block under construction is readable up to its
//! visible length, loaded once per call with a single atomic read; bytes
//! that are only buffered by the writer are never returned.
//!
//! Reads past the visible end are short: they return the visible prefix
//! and never block.
//!
//! Every chunk a read touches is verified against the stored checksums. A
//! replica that fails verification, is down, or is shorter than expected
//! is skipped in favour of the next location of the block.

use cascade_core::{CascadeError, CascadeResult};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cluster::ClusterContext;
use crate::namespace::BlockRecord;

/// Reader over the visible prefix of a file
pub struct VisibleLengthReader {
    path: String,
    cluster: Arc<ClusterContext>,
    position: u64,
}

impl VisibleLengthReader {
    pub(crate) fn new(path: String, cluster: Arc<ClusterContext>) -> Self {
        VisibleLengthReader {
            path,
            cluster,
            position: 0,
        }
    }

    /// Path being read
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Cursor used by `io::Read`
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes currently readable
    pub fn visible_length(&self) -> CascadeResult<u64> {
        let blocks = self.cluster.namespace.get_block_locations(&self.path)?;
        let mut visible = 0;
        for record in &blocks {
            visible = visible.max(record.located.offset + self.readable_length(record)?);
        }
        Ok(visible)
    }

    /// Read up to `len` bytes at file offset `offset`.
    ///
    /// Returns fewer bytes when the range extends past the visible length.
    pub fn read(&self, offset: u64, len: u64) -> CascadeResult<Vec<u8>> {
        self.cluster.check_open()?;
        let end = offset.saturating_add(len);
        let blocks = self.cluster.namespace.get_block_locations(&self.path)?;

        let mut out = Vec::new();
        let mut pos = offset;
        for record in &blocks {
            if pos >= end {
                break;
            }
            let start = record.located.offset;
            let block_end = start + self.readable_length(record)?;
            if pos >= block_end {
                if record.is_sealed() {
                    continue;
                }
                break;
            }
            if pos < start {
                return Err(CascadeError::invariant(format!(
                    "{} has no block covering offset {}",
                    self.path, pos
                )));
            }

            let take = end.min(block_end) - pos;
            let bytes = self.read_block(record, pos - start, take)?;
            pos += bytes.len() as u64;
            out.extend_from_slice(&bytes);
            if !record.is_sealed() {
                break;
            }
        }

        debug!(target: "cascade::reader", path = %self.path, offset, requested = len, returned = out.len(), "Read");
        Ok(out)
    }

    fn readable_length(&self, record: &BlockRecord) -> CascadeResult<u64> {
        if let Some(length) = record.sealed_length {
            return Ok(length);
        }
        let block = record.located.block.id;
        if let Some(visible) = self.cluster.visible_length(block) {
            return Ok(visible);
        }
        // No watermark: either not registered yet (nothing visible) or
        // sealed since `record` was resolved, in which case the namespace
        // has the final length.
        let current = self.cluster.namespace.get_block_locations(&self.path)?;
        Ok(current
            .iter()
            .find(|b| b.located.block.id == block)
            .and_then(|b| b.sealed_length)
            .unwrap_or(0))
    }

    /// Read from the first replica that returns `len` verified bytes.
    fn read_block(&self, record: &BlockRecord, offset: u64, len: u64) -> CascadeResult<Vec<u8>> {
        let block = record.located.block;
        let mut last_error = None;
        for (index, location) in record.located.locations.iter().enumerate() {
            let attempt = self
                .cluster
                .node(location.node_id)
                .and_then(|node| node.read_block(block.id, offset, len));
            match attempt {
                Ok(bytes) if bytes.len() as u64 == len => return Ok(bytes),
                Ok(bytes) => {
                    warn!(
                        target: "cascade::reader",
                        block = %block,
                        replica_index = index,
                        expected = len,
                        got = bytes.len(),
                        "Replica shorter than visible length, trying next"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "cascade::reader",
                        block = %block,
                        replica_index = index,
                        error = %e,
                        "Replica read failed, trying next"
                    );
                    // Keep a corruption error over later, less specific ones.
                    if !matches!(last_error, Some(CascadeError::Corruption { .. })) {
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CascadeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("no replica of {} holds {} bytes at {}", block, len, offset),
            ))
        }))
    }
}

impl io::Read for VisibleLengthReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = VisibleLengthReader::read(self, self.position, buf.len() as u64)?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        self.position += bytes.len() as u64;
        Ok(bytes.len())
    }
}

impl io::Seek for VisibleLengthReader {
    /// `SeekFrom::End` is relative to the visible length.
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            io::SeekFrom::Start(offset) => {
                self.position = offset;
                return Ok(offset);
            }
            io::SeekFrom::Current(delta) => (self.position, delta),
            io::SeekFrom::End(delta) => (self.visible_length()?, delta),
        };
        let target = if delta >= 0 {
            base.checked_add(delta as u64)
        } else {
            base.checked_sub(delta.unsigned_abs())
        };
        match target {
            Some(offset) => {
                self.position = offset;
                Ok(offset)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

impl std::fmt::Debug for VisibleLengthReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibleLengthReader")
            .field("path", &self.path)
            .field("position", &self.position)
            .finish()
    }
}
