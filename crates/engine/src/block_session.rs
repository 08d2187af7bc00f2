//! Write session for one block.
//!
//! # State machine
//!
//! ```text
//! Open --hflush--> Flushing --ack--> Open --seal--> Sealed
//!                      \--failure--> Open (buffer kept)
//! ```
//!
//! Writes append to an unflushed buffer. `hflush` chunks the buffer
//! together with the carried partial chunk, pushes it through the pipeline
//! and, once every required replica has acknowledged, publishes the new
//! visible length with a single atomic store. The carry is committed only
//! after the acknowledgement, so a failed flush can be retried with exactly
//! the same bytes.

use cascade_core::{
    CascadeError, CascadeResult, ExtendedBlock, LocatedBlock, NodeId, PipelineFailure,
};
use cascade_durability::{ChecksumChunker, DataChecksum};
use cascade_pipeline::{PipelineCoordinator, VisibleLength};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a block write session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Accepting writes
    Open,
    /// A flush is in progress
    ///
    /// Set only while `hflush` runs, which holds `&mut self`; `state()`
    /// never returns it and a failed flush goes back to `Open`.
    Flushing,
    /// Length fixed; terminal
    Sealed,
}

/// A replica dropped from a block's pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedReplica {
    /// Block whose pipeline lost the replica
    pub block: ExtendedBlock,
    /// Position of the replica in pipeline order
    pub replica_index: usize,
    /// Node holding the replica
    pub node: NodeId,
    /// Failure that caused the exclusion
    pub reason: PipelineFailure,
}

/// Writer bound to one block
pub struct BlockWriteSession {
    located: LocatedBlock,
    capacity: u64,
    chunker: ChecksumChunker,
    pipeline: PipelineCoordinator,
    visible: Arc<VisibleLength>,
    unflushed: Vec<u8>,
    state: BlockState,
}

impl BlockWriteSession {
    /// Create a session over an allocated block and its pipeline.
    pub fn new(
        located: LocatedBlock,
        capacity: u64,
        checksum: DataChecksum,
        pipeline: PipelineCoordinator,
        visible: Arc<VisibleLength>,
    ) -> Self {
        BlockWriteSession {
            located,
            capacity,
            chunker: ChecksumChunker::new(checksum),
            pipeline,
            visible,
            unflushed: Vec::new(),
            state: BlockState::Open,
        }
    }

    /// Block being written
    pub fn block(&self) -> ExtendedBlock {
        self.located.block
    }

    /// Block descriptor as allocated
    pub fn located(&self) -> &LocatedBlock {
        &self.located
    }

    /// Current state
    pub fn state(&self) -> BlockState {
        self.state
    }

    /// Whether the block is sealed
    pub fn is_sealed(&self) -> bool {
        self.state == BlockState::Sealed
    }

    /// Bytes accepted so far, flushed or not
    pub fn written_length(&self) -> u64 {
        self.chunker.committed_offset() + self.unflushed.len() as u64
    }

    /// Bytes written but not yet acknowledged
    pub fn unflushed_len(&self) -> usize {
        self.unflushed.len()
    }

    /// Capacity left in the block
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.written_length())
    }

    /// Visible length; safe to call from any thread via `watermark()`
    #[inline]
    pub fn visible_length(&self) -> u64 {
        self.visible.get()
    }

    /// Shared handle on the visibility watermark
    pub fn watermark(&self) -> Arc<VisibleLength> {
        Arc::clone(&self.visible)
    }

    /// Replicas dropped from this block's pipeline, in pipeline order.
    ///
    /// Only non-empty when a minimum ack count lets flushes succeed
    /// without every replica.
    pub fn excluded_replicas(&self) -> Vec<ExcludedReplica> {
        let block = self.located.block;
        self.pipeline
            .excluded()
            .into_iter()
            .map(|(replica_index, reason)| ExcludedReplica {
                block,
                replica_index,
                node: self.located.locations[replica_index].node_id,
                reason,
            })
            .collect()
    }

    /// Whether the pipeline has lost a replica
    pub fn is_degraded(&self) -> bool {
        !self.pipeline.excluded().is_empty()
    }

    /// Buffer `data`. It must fit in the remaining capacity.
    pub fn write(&mut self, data: &[u8]) -> CascadeResult<()> {
        if self.state != BlockState::Open {
            return Err(self.violation(format!("write to {:?} block", self.state)));
        }
        if data.len() as u64 > self.remaining() {
            return Err(self.violation(format!(
                "write of {} bytes exceeds remaining capacity {}",
                data.len(),
                self.remaining()
            )));
        }
        self.unflushed.extend_from_slice(data);
        Ok(())
    }

    /// Push every buffered byte through the pipeline and publish it.
    ///
    /// Blocks until the pipeline acknowledges. Returns the visible length.
    /// On failure nothing is published and the buffer is kept.
    pub fn hflush(&mut self) -> CascadeResult<u64> {
        if self.state == BlockState::Sealed {
            return Err(self.violation("flush on sealed block".to_string()));
        }
        if self.unflushed.is_empty() {
            return Ok(self.visible.get());
        }

        let batch = self.chunker.chunk(&self.unflushed)?;
        self.state = BlockState::Flushing;
        let result = self.pipeline.flush(&batch);
        self.state = BlockState::Open;
        let outcome = result?;

        if outcome.acked_length != batch.end_offset() {
            return Err(self.violation(format!(
                "pipeline acked {} for a flush ending at {}",
                outcome.acked_length,
                batch.end_offset()
            )));
        }
        self.chunker.commit(&batch)?;
        self.unflushed.clear();
        let visible = self.visible.publish(outcome.acked_length);

        if outcome.is_degraded() {
            warn!(
                target: "cascade::block",
                block = %self.located.block,
                excluded = outcome.excluded.len(),
                "Flush acknowledged by a degraded pipeline"
            );
        }
        debug!(
            target: "cascade::block",
            block = %self.located.block,
            offset = batch.start_offset,
            len = batch.payload_len(),
            visible,
            "Block flushed"
        );
        Ok(visible)
    }

    /// Flush what is left, finalize the replicas and fix the length.
    ///
    /// Idempotent: sealing a sealed block returns its length.
    pub fn seal(&mut self) -> CascadeResult<u64> {
        if self.state == BlockState::Sealed {
            return Ok(self.visible.get());
        }
        self.hflush()?;
        let length = self.chunker.committed_offset();
        self.pipeline.finalize(length)?;
        let sealed = self.visible.seal(length);
        self.state = BlockState::Sealed;
        info!(target: "cascade::block", block = %self.located.block, length = sealed, "Block sealed");
        Ok(sealed)
    }

    fn violation(&self, detail: String) -> CascadeError {
        error!(target: "cascade::block", block = %self.located.block, detail = %detail, "Invariant violation");
        CascadeError::invariant(format!("{}: {}", self.located.block, detail))
    }
}

impl std::fmt::Debug for BlockWriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWriteSession")
            .field("block", &self.located.block)
            .field("state", &self.state)
            .field("written", &self.written_length())
            .field("visible", &self.visible.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{BlockId, GenerationStamp, NodeId};
    use cascade_pipeline::{AckPolicy, ReplicaConnection, ReplicaNode};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        nodes: Vec<Arc<ReplicaNode>>,
        session: BlockWriteSession,
    }

    fn fixture(capacity: u64, chunk: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let nodes: Vec<_> = (0..2)
            .map(|i| ReplicaNode::new(NodeId(i), dir.path().join(format!("n{}", i))).unwrap())
            .collect();
        let block = ExtendedBlock::new(BlockId(3), GenerationStamp(1000));
        let checksum = DataChecksum::crc32(chunk).unwrap();
        let conns = nodes
            .iter()
            .map(|n| Box::new(n.connect(block, checksum).unwrap()) as Box<dyn ReplicaConnection>)
            .collect();
        let pipeline = PipelineCoordinator::new(
            block,
            checksum,
            conns,
            AckPolicy::all(2, Duration::from_secs(5), 64 * 1024),
        )
        .unwrap();
        let located = LocatedBlock {
            block,
            offset: 0,
            locations: nodes.iter().map(|n| n.location()).collect(),
        };
        let session = BlockWriteSession::new(
            located,
            capacity,
            checksum,
            pipeline,
            Arc::new(VisibleLength::new()),
        );
        Fixture {
            _dir: dir,
            nodes,
            session,
        }
    }

    #[test]
    fn test_write_is_invisible_until_hflush() {
        let mut f = fixture(4096, 512);
        f.session.write(b"hello").unwrap();
        assert_eq!(f.session.visible_length(), 0);
        assert_eq!(f.session.written_length(), 5);
        assert_eq!(f.session.hflush().unwrap(), 5);
        assert_eq!(f.session.visible_length(), 5);
        assert_eq!(f.session.unflushed_len(), 0);
    }

    #[test]
    fn test_visible_length_monotonic_across_flushes() {
        let mut f = fixture(4096, 100);
        let mut last = 0;
        for i in 0..20u8 {
            f.session.write(&[i; 37]).unwrap();
            let visible = f.session.hflush().unwrap();
            assert!(visible > last);
            last = visible;
        }
        assert_eq!(last, 740);
    }

    #[test]
    fn test_write_beyond_capacity_rejected() {
        let mut f = fixture(10, 4);
        f.session.write(&[0; 8]).unwrap();
        assert_eq!(f.session.remaining(), 2);
        assert!(f.session.write(&[0; 3]).unwrap_err().is_fatal());
    }

    #[test]
    fn test_failed_flush_keeps_buffer() {
        let mut f = fixture(4096, 512);
        f.session.write(b"first").unwrap();
        f.session.hflush().unwrap();
        f.session.write(b" second").unwrap();

        f.nodes[1].corrupt_next_packet();
        let err = f.session.hflush().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.session.visible_length(), 5);
        assert_eq!(f.session.unflushed_len(), 7);
        assert_eq!(f.session.state(), BlockState::Open);

        assert_eq!(f.session.hflush().unwrap(), 12);
        assert_eq!(
            f.nodes[1].read_block(BlockId(3), 0, 12).unwrap(),
            b"first second".to_vec()
        );
    }

    #[test]
    fn test_seal_flushes_and_is_idempotent() {
        let mut f = fixture(4096, 512);
        f.session.write(b"tail bytes").unwrap();
        assert_eq!(f.session.seal().unwrap(), 10);
        assert_eq!(f.session.seal().unwrap(), 10);
        assert!(f.session.is_sealed());
        assert!(f.session.watermark().is_sealed());
        assert!(f.session.write(b"x").unwrap_err().is_fatal());
        assert!(f.session.hflush().unwrap_err().is_fatal());
    }

    #[test]
    fn test_degraded_pipeline_reported() {
        let dir = TempDir::new().unwrap();
        let nodes: Vec<_> = (0..3)
            .map(|i| ReplicaNode::new(NodeId(i), dir.path().join(format!("n{}", i))).unwrap())
            .collect();
        let block = ExtendedBlock::new(BlockId(4), GenerationStamp(1000));
        let checksum = DataChecksum::crc32(512).unwrap();
        let conns = nodes
            .iter()
            .map(|n| Box::new(n.connect(block, checksum).unwrap()) as Box<dyn ReplicaConnection>)
            .collect();
        let policy = AckPolicy {
            required: 2,
            tolerate_failures: true,
            timeout: Duration::from_secs(5),
            packet_size: 64 * 1024,
        };
        let pipeline = PipelineCoordinator::new(block, checksum, conns, policy).unwrap();
        let located = LocatedBlock {
            block,
            offset: 0,
            locations: nodes.iter().map(|n| n.location()).collect(),
        };
        let mut session =
            BlockWriteSession::new(located, 4096, checksum, pipeline, Arc::new(VisibleLength::new()));

        session.write(&[1u8; 1000]).unwrap();
        nodes[2].corrupt_next_packet();
        assert_eq!(session.hflush().unwrap(), 1000);

        assert!(session.is_degraded());
        let excluded = session.excluded_replicas();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].replica_index, 2);
        assert_eq!(excluded[0].node, NodeId(2));
        assert_eq!(excluded[0].block, block);
        assert_eq!(excluded[0].reason, PipelineFailure::ChecksumMismatch { offset: 0 });
        assert_eq!(nodes[2].durable_length(BlockId(4)), Some(0));
    }

    #[test]
    fn test_healthy_pipeline_not_degraded() {
        let mut f = fixture(4096, 512);
        f.session.write(b"abc").unwrap();
        f.session.hflush().unwrap();
        assert!(!f.session.is_degraded());
        assert!(f.session.excluded_replicas().is_empty());
    }
}
