//! Identifiers and block descriptors
//!
//! All identifiers are thin newtypes over integers so they can be copied
//! freely, hashed, and printed in the `blk_<id>` form used by on-disk names
//! and log lines.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique block identifier, allocated by the namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}", self.0)
    }
}

/// Generation stamp of a block
///
/// Bumped by the namespace whenever a block's replica set is rebuilt, so a
/// stale replica can never be mistaken for a current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationStamp(pub u64);

impl fmt::Display for GenerationStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique file identifier, allocated when a file is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file-{}", self.0)
    }
}

/// Identifier of a replica node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// A block together with the generation stamp it was written under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtendedBlock {
    /// Block identity
    pub id: BlockId,
    /// Generation stamp
    pub generation_stamp: GenerationStamp,
}

impl ExtendedBlock {
    /// Create a new extended block
    pub fn new(id: BlockId, generation_stamp: GenerationStamp) -> Self {
        ExtendedBlock {
            id,
            generation_stamp,
        }
    }
}

impl fmt::Display for ExtendedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.id, self.generation_stamp)
    }
}

/// Where one replica of a block lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaLocation {
    /// Node holding the replica
    pub node_id: NodeId,
    /// Storage identity of that node (changes if the node is reformatted)
    pub storage_id: Uuid,
}

impl fmt::Display for ReplicaLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_id)
    }
}

/// A block as seen by clients: identity, file offset, and pipeline order
///
/// `locations` is the pipeline order fixed at allocation time. Writers send
/// to `locations[0]` first; readers try locations in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedBlock {
    /// Block identity
    pub block: ExtendedBlock,
    /// Offset of the block's first byte within the file
    pub offset: u64,
    /// Replica locations in pipeline order
    pub locations: Vec<ReplicaLocation>,
}

/// Checksum algorithm applied to each verification chunk
///
/// Every algorithm produces a 4-byte value so the on-disk checksum layout
/// does not depend on the choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// No verification; every chunk checks out
    Null,
    /// CRC-32 (IEEE)
    #[default]
    Crc32,
    /// Low 32 bits of XXH3-64
    Xxh3,
}

impl ChecksumKind {
    /// Stable on-disk tag
    pub fn to_byte(self) -> u8 {
        match self {
            ChecksumKind::Null => 0,
            ChecksumKind::Crc32 => 1,
            ChecksumKind::Xxh3 => 2,
        }
    }

    /// Parse an on-disk tag
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ChecksumKind::Null),
            1 => Some(ChecksumKind::Crc32),
            2 => Some(ChecksumKind::Xxh3),
            _ => None,
        }
    }

    /// Human-readable name, matching the configuration spelling
    pub fn name(self) -> &'static str {
        match self {
            ChecksumKind::Null => "null",
            ChecksumKind::Crc32 => "crc32",
            ChecksumKind::Xxh3 => "xxh3",
        }
    }
}
