//! Write session for one file.
//!
//! A file is a sequence of blocks. The session owns at most one active
//! `BlockWriteSession` plus the list of blocks already sealed, and rolls
//! over to a new block when the active one is full. Blocks are allocated
//! lazily: the next block is only requested when a byte does not fit, so a
//! file whose length is a multiple of the block size ends without an empty
//! trailing block.
//!
//! # Errors
//!
//! Pipeline errors are retryable: the active block keeps its buffer and the
//! caller may call `hflush` or `close` again. An invariant violation
//! poisons the session; every later call fails with the same violation.

use cascade_core::{
    BlockId, CascadeConfig, CascadeError, CascadeResult, ExtendedBlock, FileId, NodeId,
};
use cascade_durability::DataChecksum;
use cascade_pipeline::{AckPolicy, PipelineCoordinator, ReplicaConnection, VisibleLength};
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::block_session::{BlockWriteSession, ExcludedReplica};
use crate::cluster::ClusterContext;

/// A block whose length is final
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedBlock {
    /// Block identity
    pub block: ExtendedBlock,
    /// Final length
    pub length: u64,
}

/// Writer for one file
pub struct FileWriteSession {
    path: String,
    file_id: FileId,
    config: CascadeConfig,
    checksum: DataChecksum,
    cluster: Arc<ClusterContext>,
    sealed: Vec<SealedBlock>,
    sealed_length: u64,
    active: Option<BlockWriteSession>,
    /// Exclusions recorded by blocks already sealed
    sealed_exclusions: Vec<ExcludedReplica>,
    poisoned: Option<String>,
    closed: bool,
}

impl FileWriteSession {
    pub(crate) fn new(
        path: String,
        file_id: FileId,
        config: CascadeConfig,
        cluster: Arc<ClusterContext>,
    ) -> CascadeResult<Self> {
        let checksum = DataChecksum::new(config.checksum, config.bytes_per_checksum)?;
        Ok(FileWriteSession {
            path,
            file_id,
            config,
            checksum,
            cluster,
            sealed: Vec::new(),
            sealed_length: 0,
            active: None,
            sealed_exclusions: Vec::new(),
            poisoned: None,
            closed: false,
        })
    }

    /// Path of the file
    pub fn path(&self) -> &str {
        &self.path
    }

    /// File identity
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Effective configuration of this file
    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Blocks sealed so far, in file order
    pub fn sealed_blocks(&self) -> &[SealedBlock] {
        &self.sealed
    }

    /// The block currently being written, if any
    pub fn active_block(&self) -> Option<&BlockWriteSession> {
        self.active.as_ref()
    }

    /// Bytes written so far, flushed or not
    pub fn len(&self) -> u64 {
        self.sealed_length + self.active.as_ref().map_or(0, |b| b.written_length())
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes readers can see
    pub fn visible_length(&self) -> u64 {
        self.sealed_length + self.active.as_ref().map_or(0, |b| b.visible_length())
    }

    /// Replicas dropped from any of this file's pipelines, in block order.
    ///
    /// With a minimum ack count configured, `hflush` succeeds while some
    /// replicas fail; this is where those failures surface.
    pub fn excluded_replicas(&self) -> Vec<ExcludedReplica> {
        let mut all = self.sealed_exclusions.clone();
        if let Some(block) = &self.active {
            all.extend(block.excluded_replicas());
        }
        all
    }

    /// Whether any block of the file was written by a degraded pipeline
    pub fn is_degraded(&self) -> bool {
        !self.sealed_exclusions.is_empty()
            || self.active.as_ref().map_or(false, |b| b.is_degraded())
    }

    /// Whether `close` has completed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffer `data`, rolling over to new blocks as they fill.
    ///
    /// If a rollover fails part way, the bytes accepted before it stay
    /// buffered; `len()` reports how many.
    pub fn write(&mut self, data: &[u8]) -> CascadeResult<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.write_step(rest)?;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Flush every buffered byte to all replicas and make it visible.
    ///
    /// Returns the file's visible length. Blocks until acknowledged.
    pub fn hflush(&mut self) -> CascadeResult<u64> {
        self.check_usable()?;
        let result = match self.active.as_mut() {
            Some(block) => block.hflush().map(|_| ()),
            None => Ok(()),
        };
        self.observe(result)?;
        Ok(self.visible_length())
    }

    /// Seal the last block and complete the file.
    ///
    /// Returns the final length, which covers every byte written including
    /// those after the last `hflush`. Idempotent once it has succeeded.
    pub fn close(&mut self) -> CascadeResult<u64> {
        if self.closed {
            return Ok(self.sealed_length);
        }
        self.check_usable()?;
        let result = self.seal_active();
        self.observe(result)?;

        let length = self.sealed_length;
        let result = self.cluster.namespace.complete_file(self.file_id, length);
        self.observe(result)?;
        self.closed = true;
        info!(
            target: "cascade::file",
            path = %self.path,
            length,
            blocks = self.sealed.len(),
            "File closed"
        );
        Ok(length)
    }

    /// Accept as much of `data` as fits in one block.
    fn write_step(&mut self, data: &[u8]) -> CascadeResult<usize> {
        self.check_usable()?;
        if self.active.as_ref().map_or(true, |b| b.remaining() == 0) {
            let result = self.seal_active();
            self.observe(result)?;
            let result = self.allocate();
            let block = self.observe(result)?;
            self.active = Some(block);
        }

        let result = match self.active.as_mut() {
            Some(block) => {
                let n = data.len().min(usize::try_from(block.remaining()).unwrap_or(usize::MAX));
                block.write(&data[..n]).map(|()| n)
            }
            None => Err(CascadeError::invariant("no active block after allocation")),
        };
        self.observe(result)
    }

    fn seal_active(&mut self) -> CascadeResult<()> {
        let Some(block) = self.active.as_mut() else {
            return Ok(());
        };
        let length = block.seal()?;
        let id = block.block();
        self.cluster.namespace.seal_block(self.file_id, id.id, length)?;
        self.cluster.retire_watermark(id.id);
        self.sealed_exclusions.extend(block.excluded_replicas());
        self.sealed.push(SealedBlock { block: id, length });
        self.sealed_length += length;
        self.active = None;
        Ok(())
    }

    fn allocate(&self) -> CascadeResult<BlockWriteSession> {
        let located = self.cluster.namespace.allocate_block(self.file_id)?;
        let block = located.block;

        let mut connections: Vec<Box<dyn ReplicaConnection>> = Vec::new();
        for (index, location) in located.locations.iter().enumerate() {
            let connected = self
                .cluster
                .node(location.node_id)
                .and_then(|node| {
                    node.connect(block, self.checksum)
                        .map_err(|f| CascadeError::pipeline(index, location.node_id, f))
                });
            match connected {
                Ok(conn) => connections.push(Box::new(conn)),
                Err(e) => {
                    warn!(
                        target: "cascade::file",
                        block = %block,
                        replica_index = index,
                        error = %e,
                        "Pipeline setup failed, abandoning block"
                    );
                    self.cluster.namespace.abandon_block(self.file_id, block.id)?;
                    return Err(e);
                }
            }
        }

        let policy = AckPolicy::from_config(&self.config, connections.len());
        let pipeline = PipelineCoordinator::new(block, self.checksum, connections, policy)?;
        let visible = Arc::new(VisibleLength::new());
        self.cluster.register_watermark(block.id, Arc::clone(&visible));

        info!(
            target: "cascade::file",
            path = %self.path,
            block = %block,
            offset = located.offset,
            pipeline = ?located.locations.iter().map(|l| l.node_id).collect::<Vec<NodeId>>(),
            "Block allocated"
        );
        Ok(BlockWriteSession::new(
            located,
            self.config.block_size,
            self.checksum,
            pipeline,
            visible,
        ))
    }

    fn check_usable(&self) -> CascadeResult<()> {
        if let Some(reason) = &self.poisoned {
            return Err(CascadeError::invariant(format!(
                "session for {} is poisoned: {}",
                self.path, reason
            )));
        }
        if self.closed {
            return Err(CascadeError::invariant(format!("{} is closed", self.path)));
        }
        self.cluster.check_open()
    }

    /// Poison the session on fatal errors.
    fn observe<T>(&mut self, result: CascadeResult<T>) -> CascadeResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && self.poisoned.is_none() {
                self.poisoned = Some(e.to_string());
            }
        }
        result
    }

    /// Ids of every block written so far, sealed or active
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.sealed
            .iter()
            .map(|s| s.block.id)
            .chain(self.active.as_ref().map(|b| b.block().id))
            .collect()
    }
}

impl io::Write for FileWriteSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.write_step(buf).map_err(io::Error::from)
    }

    /// Same as `hflush`.
    fn flush(&mut self) -> io::Result<()> {
        FileWriteSession::hflush(self)
            .map(|_| ())
            .map_err(io::Error::from)
    }
}

impl Drop for FileWriteSession {
    fn drop(&mut self) {
        if !self.closed && self.poisoned.is_none() && !self.is_empty() {
            warn!(
                target: "cascade::file",
                path = %self.path,
                written = self.len(),
                visible = self.visible_length(),
                "File session dropped without close; file stays under construction"
            );
        } else {
            debug!(target: "cascade::file", path = %self.path, "File session dropped");
        }
    }
}

impl std::fmt::Debug for FileWriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriteSession")
            .field("path", &self.path)
            .field("file_id", &self.file_id)
            .field("sealed_blocks", &self.sealed.len())
            .field("len", &self.len())
            .field("visible", &self.visible_length())
            .field("closed", &self.closed)
            .finish()
    }
}
