//! In-process replica acceptor.
//!
//! A `ReplicaNode` stands in for one storage node. It owns a directory of
//! block replicas and accepts pipeline connections; each connection gets a
//! receiver thread that decodes flush packets, applies them to the block's
//! `ReplicaWriter` and answers with an ack frame carrying the replica's
//! durable length.
//!
//! # Fault hooks
//!
//! Tests drive the pipeline's failure paths through the node:
//!
//! - `set_unresponsive(true)` stalls every receiver thread before it
//!   touches the next packet; acks stop until the node is responsive again
//! - `shutdown()` refuses new connections and ends receiver threads, which
//!   the coordinator sees as an unreachable replica; `restart()` reloads
//!   the node's replicas from its directory
//! - `corrupt_next_packet()` flips a byte in the next packet's payload after
//!   the frame is decoded, so the replica's checksum verification rejects it

use cascade_core::{
    BlockId, CascadeError, CascadeResult, ExtendedBlock, NodeId, PipelineFailure, ReplicaLocation,
};
use cascade_durability::{
    parse_meta_file_name, AckStatus, DataChecksum, FlushPacket, PacketAck, ReplicaWriter,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::LocalConnection;

const STALL_POLL: Duration = Duration::from_millis(2);

/// Availability of a replica node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeHealth {
    /// Serving connections
    Healthy = 0,
    /// Accepting frames but not processing them
    Unresponsive = 1,
    /// Refusing connections; receiver threads exit
    Down = 2,
}

impl NodeHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeHealth::Healthy,
            1 => NodeHealth::Unresponsive,
            _ => NodeHealth::Down,
        }
    }
}

/// One storage node holding block replicas
pub struct ReplicaNode {
    id: NodeId,
    storage_id: Uuid,
    dir: PathBuf,
    replicas: DashMap<BlockId, Arc<ReplicaWriter>>,
    health: AtomicU8,
    corrupt_next: AtomicBool,
    packets_applied: AtomicU64,
}

impl ReplicaNode {
    /// Create a node storing its replicas under `dir`.
    pub fn new(id: NodeId, dir: impl Into<PathBuf>) -> CascadeResult<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(ReplicaNode {
            id,
            storage_id: Uuid::new_v4(),
            dir,
            replicas: DashMap::new(),
            health: AtomicU8::new(NodeHealth::Healthy as u8),
            corrupt_next: AtomicBool::new(false),
            packets_applied: AtomicU64::new(0),
        }))
    }

    /// Node identifier
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Location record handed out by the namespace
    pub fn location(&self) -> ReplicaLocation {
        ReplicaLocation {
            node_id: self.id,
            storage_id: self.storage_id,
        }
    }

    /// Directory holding this node's replicas
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current availability
    pub fn health(&self) -> NodeHealth {
        NodeHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Stall (or resume) packet processing on every connection.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        let (from, to) = if unresponsive {
            (NodeHealth::Healthy, NodeHealth::Unresponsive)
        } else {
            (NodeHealth::Unresponsive, NodeHealth::Healthy)
        };
        let _ = self.health.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        warn!(target: "cascade::node", node = %self.id, unresponsive, "Replica node responsiveness changed");
    }

    /// Take the node down. Existing connections fail; new ones are refused.
    ///
    /// Every replica is flushed to stable storage on the way down.
    pub fn shutdown(&self) {
        self.health.store(NodeHealth::Down as u8, Ordering::Release);
        for entry in self.replicas.iter() {
            if let Err(e) = entry.value().flush() {
                warn!(
                    target: "cascade::node",
                    node = %self.id,
                    block = %entry.value().block(),
                    error = %e,
                    "Failed to flush replica during shutdown"
                );
            }
        }
        warn!(target: "cascade::node", node = %self.id, "Replica node shut down");
    }

    /// Bring a node that was shut down back up.
    ///
    /// The replica map is rebuilt from the node's directory: each replica is
    /// reopened and comes back with the durable length recovered from disk.
    /// A replica that no longer opens is left out. Finalization is not
    /// persisted, so reloaded replicas accept appends again. Returns the
    /// number of replicas loaded. Restarting a node that is up does nothing.
    pub fn restart(&self) -> CascadeResult<usize> {
        if self.health() != NodeHealth::Down {
            return Ok(self.replicas.len());
        }

        let mut latest: HashMap<BlockId, ExtendedBlock> = HashMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let block = match name.to_str().and_then(parse_meta_file_name) {
                Some(block) => block,
                None => continue,
            };
            latest
                .entry(block.id)
                .and_modify(|b| {
                    if block.generation_stamp > b.generation_stamp {
                        *b = block;
                    }
                })
                .or_insert(block);
        }

        self.replicas.clear();
        for block in latest.into_values() {
            match ReplicaWriter::open(&self.dir, block) {
                Ok(replica) => {
                    self.replicas.insert(block.id, Arc::new(replica));
                }
                Err(e) => {
                    warn!(
                        target: "cascade::node",
                        node = %self.id,
                        block = %block,
                        error = %e,
                        "Replica failed to reopen, leaving it out"
                    );
                }
            }
        }

        let loaded = self.replicas.len();
        self.health.store(NodeHealth::Healthy as u8, Ordering::Release);
        debug!(target: "cascade::node", node = %self.id, replicas = loaded, "Replica node restarted");
        Ok(loaded)
    }

    /// Corrupt the payload of the next packet any connection receives.
    pub fn corrupt_next_packet(&self) {
        self.corrupt_next.store(true, Ordering::Release);
    }

    /// Packets applied successfully since the node started
    pub fn packets_applied(&self) -> u64 {
        self.packets_applied.load(Ordering::Relaxed)
    }

    /// Replica of `block_id` held by this node, if any
    pub fn replica(&self, block_id: BlockId) -> Option<Arc<ReplicaWriter>> {
        self.replicas.get(&block_id).map(|r| Arc::clone(r.value()))
    }

    /// Open a pipeline connection for `block`, creating its replica.
    ///
    /// Reconnecting to a block this node already holds reuses the replica.
    pub fn connect(
        self: &Arc<Self>,
        block: ExtendedBlock,
        checksum: DataChecksum,
    ) -> Result<LocalConnection, PipelineFailure> {
        if self.health() == NodeHealth::Down {
            return Err(PipelineFailure::Unreachable);
        }

        let replica = match self.replica(block.id) {
            Some(existing) => existing,
            None => {
                let created = ReplicaWriter::create(&self.dir, block, checksum)
                    .map_err(|e| PipelineFailure::Rejected(e.to_string()))?;
                let created = Arc::new(created);
                self.replicas.insert(block.id, Arc::clone(&created));
                created
            }
        };

        let (packet_tx, packet_rx) = channel::<Vec<u8>>();
        let (ack_tx, ack_rx) = channel::<Vec<u8>>();
        let node = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("cascade-xceiver-{}-{}", self.id, block.id))
            .spawn(move || node.receive(replica, packet_rx, ack_tx))
            .map_err(|e| PipelineFailure::Rejected(format!("failed to spawn receiver: {}", e)))?;

        debug!(target: "cascade::node", node = %self.id, block = %block, "Pipeline connection opened");
        Ok(LocalConnection::new(self.id, packet_tx, ack_rx, handle))
    }

    /// Read up to `len` verified bytes of a block replica at `offset`.
    pub fn read_block(&self, block_id: BlockId, offset: u64, len: u64) -> CascadeResult<Vec<u8>> {
        if self.health() == NodeHealth::Down {
            return Err(CascadeError::Closed(format!("{} is down", self.id)));
        }
        let replica = self.replica(block_id).ok_or_else(|| {
            CascadeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} holds no replica of {}", self.id, block_id),
            ))
        })?;
        replica.read(offset, len)
    }

    /// Durable length of the replica of `block_id`, if held
    pub fn durable_length(&self, block_id: BlockId) -> Option<u64> {
        self.replica(block_id).map(|r| r.durable_length())
    }

    /// Whether `replica` is still the one this node serves for its block
    fn holds(&self, replica: &Arc<ReplicaWriter>) -> bool {
        self.replicas
            .get(&replica.block().id)
            .map(|current| Arc::ptr_eq(current.value(), replica))
            .unwrap_or(false)
    }

    /// Receiver loop for one connection.
    fn receive(&self, replica: Arc<ReplicaWriter>, packets: Receiver<Vec<u8>>, acks: Sender<Vec<u8>>) {
        for frame in packets {
            loop {
                match self.health() {
                    NodeHealth::Healthy => break,
                    NodeHealth::Unresponsive => std::thread::sleep(STALL_POLL),
                    NodeHealth::Down => return,
                }
            }
            if !self.holds(&replica) {
                debug!(target: "cascade::node", node = %self.id, block = %replica.block(), "Replica reloaded, closing stale connection");
                return;
            }

            let mut packet = match FlushPacket::from_bytes(&frame) {
                Ok(p) => p,
                Err(e) => {
                    warn!(target: "cascade::node", node = %self.id, error = %e, "Undecodable frame, closing connection");
                    return;
                }
            };

            if !packet.chunks.is_empty() && self.corrupt_next.swap(false, Ordering::AcqRel) {
                if let Some(byte) = packet.chunks.first_mut().and_then(|c| c.data.first_mut()) {
                    *byte ^= 0xFF;
                    warn!(target: "cascade::node", node = %self.id, seqno = packet.seqno, "Injected packet corruption");
                }
            }

            let ack = self.apply(&replica, &packet);
            if acks.send(ack.to_bytes()).is_err() {
                return;
            }
        }
    }

    fn apply(&self, replica: &ReplicaWriter, packet: &FlushPacket) -> PacketAck {
        if packet.block != replica.block() || packet.checksum != replica.checksum() {
            return PacketAck {
                seqno: packet.seqno,
                status: AckStatus::Error(format!(
                    "packet for {} does not match replica of {}",
                    packet.block,
                    replica.block()
                )),
                durable_length: replica.durable_length(),
            };
        }

        let result = if packet.last_in_block {
            replica.finalize(packet.offset_in_block)
        } else {
            replica.append(packet.offset_in_block, &packet.chunks)
        };

        match result {
            Ok(durable) => {
                self.packets_applied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "cascade::node",
                    node = %self.id,
                    block = %packet.block,
                    seqno = packet.seqno,
                    durable,
                    "Packet applied"
                );
                PacketAck::success(packet.seqno, durable)
            }
            Err(CascadeError::Corruption { offset, .. }) => {
                warn!(
                    target: "cascade::node",
                    node = %self.id,
                    block = %packet.block,
                    seqno = packet.seqno,
                    offset,
                    "Packet failed checksum verification"
                );
                PacketAck {
                    seqno: packet.seqno,
                    status: AckStatus::ChecksumError { offset },
                    durable_length: replica.durable_length(),
                }
            }
            Err(e) => {
                warn!(
                    target: "cascade::node",
                    node = %self.id,
                    block = %packet.block,
                    seqno = packet.seqno,
                    error = %e,
                    "Packet rejected"
                );
                PacketAck {
                    seqno: packet.seqno,
                    status: AckStatus::Error(e.to_string()),
                    durable_length: replica.durable_length(),
                }
            }
        }
    }
}

impl std::fmt::Debug for ReplicaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaNode")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("health", &self.health())
            .field("replicas", &self.replicas.len())
            .finish()
    }
}
