//! Pipeline coordinator: flush fan-out and acknowledgement aggregation.
//!
//! One coordinator drives the pipeline of one block. Its replica order is
//! fixed when the block is allocated and is the order in which failures
//! are attributed.
//!
//! # Flush protocol
//!
//! 1. The batch is split into packets of at most `packet_size` chunk bytes
//!    and each packet gets the next sequence number.
//! 2. Every packet is sent to every live replica.
//! 3. Acks are collected replica by replica in pipeline order, each replica
//!    acking every packet in sequence before the shared deadline.
//! 4. The acked length is the minimum durable length over the replicas
//!    that acked everything.
//!
//! The outcome of a flush is one decision. Either enough replicas acked and
//! the acked length moves to the end of the batch, or the flush fails with
//! the first failing replica and the acked length does not move.
//!
//! # Degraded pipelines
//!
//! With the default policy every replica must ack. When a minimum ack count
//! is configured, replicas that fail a flush are dropped from the pipeline
//! for the rest of the block as long as enough replicas still ack.

use cascade_core::{
    CascadeConfig, CascadeError, CascadeResult, ExtendedBlock, NodeId, PipelineFailure,
};
use cascade_durability::{AckStatus, ChunkBatch, DataChecksum, FlushPacket, PacketAck};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::transport::ReplicaConnection;

/// How many acks a flush needs and how long it may wait for them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    /// Replicas that must ack every packet of a flush
    pub required: usize,
    /// Drop failed replicas instead of failing the flush when `required`
    /// is still met
    pub tolerate_failures: bool,
    /// Deadline for collecting every ack of one flush
    pub timeout: Duration,
    /// Upper bound on chunk payload bytes per packet
    pub packet_size: u64,
}

impl AckPolicy {
    /// Every replica must ack.
    pub fn all(pipeline_len: usize, timeout: Duration, packet_size: u64) -> Self {
        AckPolicy {
            required: pipeline_len,
            tolerate_failures: false,
            timeout,
            packet_size,
        }
    }

    /// Policy for a pipeline of `pipeline_len` replicas under `config`.
    pub fn from_config(config: &CascadeConfig, pipeline_len: usize) -> Self {
        let required = config.required_acks(pipeline_len);
        AckPolicy {
            required,
            tolerate_failures: config.min_acks.is_some() && required < pipeline_len,
            timeout: config.flush_timeout(),
            packet_size: u64::from(config.write_packet_size),
        }
    }
}

/// Result of a successful flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Minimum durable length across the acking replicas
    pub acked_length: u64,
    /// Pipeline indexes of replicas dropped so far, with the failure that
    /// dropped them
    pub excluded: Vec<(usize, PipelineFailure)>,
}

impl FlushOutcome {
    /// Whether the pipeline has lost replicas
    pub fn is_degraded(&self) -> bool {
        !self.excluded.is_empty()
    }
}

struct Member {
    index: usize,
    node: NodeId,
    conn: Box<dyn ReplicaConnection>,
    excluded: Option<PipelineFailure>,
}

/// Drives the replica pipeline of one block
pub struct PipelineCoordinator {
    block: ExtendedBlock,
    checksum: DataChecksum,
    policy: AckPolicy,
    members: Vec<Member>,
    next_seqno: u64,
    acked_length: u64,
    finalized: bool,
}

impl PipelineCoordinator {
    /// Create a coordinator over `connections`, in pipeline order.
    pub fn new(
        block: ExtendedBlock,
        checksum: DataChecksum,
        connections: Vec<Box<dyn ReplicaConnection>>,
        policy: AckPolicy,
    ) -> CascadeResult<Self> {
        if connections.is_empty() {
            return Err(CascadeError::invariant(format!(
                "pipeline for {} has no replicas",
                block
            )));
        }
        if policy.required == 0 || policy.required > connections.len() {
            return Err(CascadeError::InvalidConfig(format!(
                "ack policy requires {} of {} replicas",
                policy.required,
                connections.len()
            )));
        }
        if policy.packet_size < checksum.chunk_len() {
            return Err(CascadeError::InvalidConfig(format!(
                "packet size {} is smaller than checksum chunk {}",
                policy.packet_size,
                checksum.chunk_len()
            )));
        }

        let members = connections
            .into_iter()
            .enumerate()
            .map(|(index, conn)| Member {
                index,
                node: conn.node(),
                conn,
                excluded: None,
            })
            .collect();

        Ok(PipelineCoordinator {
            block,
            checksum,
            policy,
            members,
            next_seqno: 0,
            acked_length: 0,
            finalized: false,
        })
    }

    /// Block this pipeline writes
    pub fn block(&self) -> ExtendedBlock {
        self.block
    }

    /// Length every required replica has acknowledged
    pub fn acked_length(&self) -> u64 {
        self.acked_length
    }

    /// Nodes still in the pipeline, in order
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.live().map(|m| m.node).collect()
    }

    /// Replicas dropped from the pipeline
    pub fn excluded(&self) -> Vec<(usize, PipelineFailure)> {
        self.members
            .iter()
            .filter_map(|m| m.excluded.clone().map(|f| (m.index, f)))
            .collect()
    }

    /// Whether the final packet has been acknowledged
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Send `batch` through the pipeline and wait for acknowledgements.
    ///
    /// Returns once the acked length covers the end of the batch. On
    /// failure the acked length is unchanged and the error names the first
    /// failing replica in pipeline order.
    pub fn flush(&mut self, batch: &ChunkBatch) -> CascadeResult<FlushOutcome> {
        if self.finalized {
            return Err(CascadeError::invariant(format!(
                "flush on finalized pipeline of {}",
                self.block
            )));
        }
        if batch.is_empty() {
            return Ok(self.outcome());
        }
        batch.validate(self.checksum.bytes_per_chunk())?;

        let frames: Vec<(u64, Vec<u8>)> = batch
            .split(self.policy.packet_size)
            .into_iter()
            .map(|piece| {
                let seqno = self.take_seqno();
                let packet = FlushPacket::data(self.block, seqno, self.checksum, piece);
                (seqno, packet.to_bytes())
            })
            .collect();

        debug!(
            target: "cascade::pipeline",
            block = %self.block,
            offset = batch.start_offset,
            len = batch.payload_len(),
            packets = frames.len(),
            "Flushing batch"
        );
        self.round(&frames, batch.end_offset())
    }

    /// Finalize every replica at `length`.
    ///
    /// `length` must equal the acked length: every byte has to be flushed
    /// before the block can be finalized. Idempotent.
    pub fn finalize(&mut self, length: u64) -> CascadeResult<FlushOutcome> {
        if self.finalized {
            return Ok(self.outcome());
        }
        if length != self.acked_length {
            return Err(CascadeError::invariant(format!(
                "finalizing {} at {} with acked length {}",
                self.block, length, self.acked_length
            )));
        }
        let seqno = self.take_seqno();
        let frame = FlushPacket::last(self.block, seqno, self.checksum, length).to_bytes();
        let outcome = self.round(&[(seqno, frame)], length)?;
        self.finalized = true;
        debug!(target: "cascade::pipeline", block = %self.block, length, "Pipeline finalized");
        Ok(outcome)
    }

    fn take_seqno(&mut self) -> u64 {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        seqno
    }

    fn live(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.excluded.is_none())
    }

    fn outcome(&self) -> FlushOutcome {
        FlushOutcome {
            acked_length: self.acked_length,
            excluded: self.excluded(),
        }
    }

    /// Send `frames` to every live replica and aggregate the acks.
    fn round(&mut self, frames: &[(u64, Vec<u8>)], expected_end: u64) -> CascadeResult<FlushOutcome> {
        let deadline = Instant::now() + self.policy.timeout;
        let timeout = self.policy.timeout;

        let mut results: Vec<(usize, Result<u64, PipelineFailure>)> = Vec::new();
        let mut sent: Vec<Result<(), PipelineFailure>> = Vec::new();
        for member in self.members.iter_mut().filter(|m| m.excluded.is_none()) {
            let outcome = frames
                .iter()
                .try_for_each(|(_, frame)| member.conn.send(frame.clone()));
            sent.push(outcome);
        }

        let live = self.members.iter_mut().filter(|m| m.excluded.is_none());
        for (member, sent) in live.zip(sent) {
            let result = sent.and_then(|()| {
                let mut durable = 0;
                for (seqno, _) in frames {
                    durable = await_ack(member.conn.as_mut(), *seqno, deadline, timeout)?;
                }
                if durable < expected_end {
                    return Err(PipelineFailure::Rejected(format!(
                        "replica durable at {} after flush to {}",
                        durable, expected_end
                    )));
                }
                Ok(durable)
            });
            results.push((member.index, result));
        }

        let acked: Vec<u64> = results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok().copied())
            .collect();
        let first_failure = results
            .iter()
            .find_map(|(i, r)| r.as_ref().err().map(|f| (*i, f.clone())));

        if let Some((index, reason)) = first_failure {
            let node = self.members[index].node;
            if !self.policy.tolerate_failures {
                warn!(
                    target: "cascade::pipeline",
                    block = %self.block,
                    replica_index = index,
                    node = %node,
                    reason = %reason,
                    "Flush failed"
                );
                return Err(CascadeError::pipeline(index, node, reason));
            }
            if acked.len() < self.policy.required {
                warn!(
                    target: "cascade::pipeline",
                    block = %self.block,
                    replica_index = index,
                    acked = acked.len(),
                    required = self.policy.required,
                    "Flush failed: not enough replicas acknowledged"
                );
                return Err(CascadeError::pipeline(
                    index,
                    node,
                    PipelineFailure::InsufficientAcks {
                        acked: acked.len(),
                        required: self.policy.required,
                    },
                ));
            }
            for (i, r) in &results {
                if let Err(failure) = r {
                    let member = &mut self.members[*i];
                    warn!(
                        target: "cascade::pipeline",
                        block = %self.block,
                        replica_index = *i,
                        node = %member.node,
                        reason = %failure,
                        "Dropping replica from pipeline"
                    );
                    member.excluded = Some(failure.clone());
                }
            }
        }

        // At least `required` (>= 1) replicas acked.
        let min = acked.iter().copied().min().unwrap_or(self.acked_length);
        self.acked_length = self.acked_length.max(min);
        Ok(self.outcome())
    }
}

/// Wait for the ack of `seqno`, skipping acks left over from earlier
/// failed flushes.
fn await_ack(
    conn: &mut dyn ReplicaConnection,
    seqno: u64,
    deadline: Instant,
    timeout: Duration,
) -> Result<u64, PipelineFailure> {
    loop {
        let frame = conn.recv(deadline).map_err(|f| match f {
            PipelineFailure::TimedOut { .. } => PipelineFailure::TimedOut { waited: timeout },
            other => other,
        })?;
        let ack = PacketAck::from_bytes(&frame)
            .map_err(|e| PipelineFailure::Rejected(format!("bad ack frame: {}", e)))?;
        if ack.seqno < seqno {
            continue;
        }
        if ack.seqno > seqno {
            return Err(PipelineFailure::Rejected(format!(
                "ack for packet {} while waiting for {}",
                ack.seqno, seqno
            )));
        }
        return match ack.status {
            AckStatus::Success => Ok(ack.durable_length),
            AckStatus::ChecksumError { offset } => Err(PipelineFailure::ChecksumMismatch { offset }),
            AckStatus::Error(msg) => Err(PipelineFailure::Rejected(msg)),
        };
    }
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("block", &self.block)
            .field("acked_length", &self.acked_length)
            .field("next_seqno", &self.next_seqno)
            .field("live", &self.live_nodes())
            .field("finalized", &self.finalized)
            .finish()
    }
}
