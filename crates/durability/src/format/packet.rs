//! Flush packet and acknowledgement frames.
//!
//! Every message exchanged with a replica is one frame:
//!
//! ```text
//! ┌───────────┬─────────┬──────────┬────────────────┬──────────────┬──────────┐
//! │ Magic (4) │ Ver (1) │ Kind (1) │ Body len (4)   │ Body         │ CRC32 (4)│
//! └───────────┴─────────┴──────────┴────────────────┴──────────────┴──────────┘
//! ```
//!
//! The CRC covers kind, body length and body.
//!
//! # Packet body
//!
//! ```text
//! block id (8) | gen stamp (8) | seqno (8) | offset in block (8)
//! checksum kind (1) | bytes per chunk (4) | flags (1) | chunk count (4)
//! per chunk: length (4) | checksum (4) | data
//! ```
//!
//! Chunks are tagged implicitly: the packet's `offset_in_block` plus the
//! running sum of chunk lengths gives the absolute block offset each chunk
//! extends to.
//!
//! # Ack body
//!
//! ```text
//! seqno (8) | status (1) | status detail | durable length (8)
//! ```

use crate::checksum::DataChecksum;
use crate::chunker::{Chunk, ChunkBatch};
use byteorder::{LittleEndian, ReadBytesExt};
use cascade_core::{BlockId, CascadeError, ChecksumKind, ExtendedBlock, GenerationStamp};
use std::io::{Cursor, Read};

/// Magic bytes identifying a frame: "CSPK"
pub const FRAME_MAGIC: [u8; 4] = *b"CSPK";

/// Current frame format version
pub const FRAME_VERSION: u8 = 1;

const KIND_PACKET: u8 = 1;
const KIND_ACK: u8 = 2;

const FRAME_HEADER_SIZE: usize = 10;
const FRAME_TRAILER_SIZE: usize = 4;

const FLAG_LAST_IN_BLOCK: u8 = 0x01;

const STATUS_SUCCESS: u8 = 0;
const STATUS_CHECKSUM_ERROR: u8 = 1;
const STATUS_ERROR: u8 = 2;

/// Errors decoding a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Frame does not start with `FRAME_MAGIC`
    #[error("bad frame magic")]
    BadMagic,

    /// Frame written by an unknown format version
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    /// Frame holds a different message type than expected
    #[error("expected frame kind {expected}, got {actual}")]
    UnexpectedKind {
        /// Kind the decoder wanted
        expected: u8,
        /// Kind found in the frame
        actual: u8,
    },

    /// Frame ended early
    #[error("truncated frame")]
    Truncated,

    /// Frame CRC does not match its contents
    #[error("frame CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// CRC stored in the trailer
        stored: u32,
        /// CRC computed over the frame
        computed: u32,
    },

    /// A field holds a value outside its domain
    #[error("invalid field: {0}")]
    InvalidField(String),
}

impl From<FrameError> for CascadeError {
    fn from(e: FrameError) -> Self {
        CascadeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl From<std::io::Error> for FrameError {
    fn from(_: std::io::Error) -> Self {
        FrameError::Truncated
    }
}

fn encode_frame(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len() + FRAME_TRAILER_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.push(kind);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    let crc = crc32fast::hash(&frame[5..]);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn decode_frame(bytes: &[u8], expected_kind: u8) -> Result<&[u8], FrameError> {
    if bytes.len() < FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE {
        return Err(FrameError::Truncated);
    }
    if bytes[0..4] != FRAME_MAGIC {
        return Err(FrameError::BadMagic);
    }
    if bytes[4] != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(bytes[4]));
    }
    let kind = bytes[5];
    let body_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let body_end = FRAME_HEADER_SIZE + body_len;
    if bytes.len() != body_end + FRAME_TRAILER_SIZE {
        return Err(FrameError::Truncated);
    }

    let stored = u32::from_le_bytes([
        bytes[body_end],
        bytes[body_end + 1],
        bytes[body_end + 2],
        bytes[body_end + 3],
    ]);
    let computed = crc32fast::hash(&bytes[5..body_end]);
    if stored != computed {
        return Err(FrameError::CrcMismatch { stored, computed });
    }
    if kind != expected_kind {
        return Err(FrameError::UnexpectedKind {
            expected: expected_kind,
            actual: kind,
        });
    }
    Ok(&bytes[FRAME_HEADER_SIZE..body_end])
}

/// One unit of data sent down the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushPacket {
    /// Target block
    pub block: ExtendedBlock,
    /// Sequence number, increasing per block
    pub seqno: u64,
    /// Block offset of the first chunk; chunk-aligned
    pub offset_in_block: u64,
    /// Checksum geometry of the chunks
    pub checksum: DataChecksum,
    /// Set on the final, empty packet that finalizes the block
    pub last_in_block: bool,
    /// Chunks in block order
    pub chunks: Vec<Chunk>,
}

impl FlushPacket {
    /// Build a data packet from a chunk batch.
    pub fn data(block: ExtendedBlock, seqno: u64, checksum: DataChecksum, batch: ChunkBatch) -> Self {
        FlushPacket {
            block,
            seqno,
            offset_in_block: batch.start_offset,
            checksum,
            last_in_block: false,
            chunks: batch.chunks,
        }
    }

    /// Build the empty packet that finalizes a block at `length`.
    pub fn last(block: ExtendedBlock, seqno: u64, checksum: DataChecksum, length: u64) -> Self {
        FlushPacket {
            block,
            seqno,
            offset_in_block: length,
            checksum,
            last_in_block: true,
            chunks: Vec::new(),
        }
    }

    /// Data bytes carried
    pub fn payload_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    /// Block offset the packet's data extends to
    pub fn end_offset(&self) -> u64 {
        self.offset_in_block + self.payload_len()
    }

    /// Serialize to a frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.payload_len() as usize;
        let mut body = Vec::with_capacity(42 + self.chunks.len() * 8 + payload);
        body.extend_from_slice(&self.block.id.0.to_le_bytes());
        body.extend_from_slice(&self.block.generation_stamp.0.to_le_bytes());
        body.extend_from_slice(&self.seqno.to_le_bytes());
        body.extend_from_slice(&self.offset_in_block.to_le_bytes());
        body.push(self.checksum.kind().to_byte());
        body.extend_from_slice(&self.checksum.bytes_per_chunk().to_le_bytes());
        body.push(if self.last_in_block { FLAG_LAST_IN_BLOCK } else { 0 });
        body.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        for chunk in &self.chunks {
            body.extend_from_slice(&(chunk.data.len() as u32).to_le_bytes());
            body.extend_from_slice(&chunk.checksum.to_le_bytes());
            body.extend_from_slice(&chunk.data);
        }
        encode_frame(KIND_PACKET, &body)
    }

    /// Deserialize from a frame.
    ///
    /// Chunk checksums are carried as-is; verifying them is the replica's job.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let body = decode_frame(bytes, KIND_PACKET)?;
        let mut cursor = Cursor::new(body);

        let block_id = cursor.read_u64::<LittleEndian>()?;
        let generation_stamp = cursor.read_u64::<LittleEndian>()?;
        let seqno = cursor.read_u64::<LittleEndian>()?;
        let offset_in_block = cursor.read_u64::<LittleEndian>()?;
        let kind_byte = cursor.read_u8()?;
        let kind = ChecksumKind::from_byte(kind_byte)
            .ok_or_else(|| FrameError::InvalidField(format!("checksum kind {}", kind_byte)))?;
        let bytes_per_chunk = cursor.read_u32::<LittleEndian>()?;
        let checksum = DataChecksum::new(kind, bytes_per_chunk)
            .map_err(|e| FrameError::InvalidField(e.to_string()))?;
        let flags = cursor.read_u8()?;
        let count = cursor.read_u32::<LittleEndian>()? as usize;

        let mut chunks = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let len = cursor.read_u32::<LittleEndian>()?;
            if len == 0 || len > bytes_per_chunk {
                return Err(FrameError::InvalidField(format!(
                    "chunk length {} with chunk size {}",
                    len, bytes_per_chunk
                )));
            }
            let sum = cursor.read_u32::<LittleEndian>()?;
            let mut data = vec![0u8; len as usize];
            cursor.read_exact(&mut data)?;
            chunks.push(Chunk {
                data,
                checksum: sum,
            });
        }
        if cursor.position() as usize != body.len() {
            return Err(FrameError::InvalidField("trailing bytes in packet".to_string()));
        }

        Ok(FlushPacket {
            block: ExtendedBlock::new(BlockId(block_id), GenerationStamp(generation_stamp)),
            seqno,
            offset_in_block,
            checksum,
            last_in_block: flags & FLAG_LAST_IN_BLOCK != 0,
            chunks,
        })
    }
}

/// Outcome reported by a replica for one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    /// Packet persisted
    Success,
    /// A chunk failed verification; nothing from the packet was stored
    ChecksumError {
        /// Block offset of the failing chunk
        offset: u64,
    },
    /// Packet refused for another reason
    Error(String),
}

/// A replica's acknowledgement of one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketAck {
    /// Sequence number of the acknowledged packet
    pub seqno: u64,
    /// Outcome
    pub status: AckStatus,
    /// Replica's durable length after handling the packet
    pub durable_length: u64,
}

impl PacketAck {
    /// Successful ack
    pub fn success(seqno: u64, durable_length: u64) -> Self {
        PacketAck {
            seqno,
            status: AckStatus::Success,
            durable_length,
        }
    }

    /// Whether the packet was persisted
    pub fn is_success(&self) -> bool {
        matches!(self.status, AckStatus::Success)
    }

    /// Serialize to a frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32);
        body.extend_from_slice(&self.seqno.to_le_bytes());
        match &self.status {
            AckStatus::Success => body.push(STATUS_SUCCESS),
            AckStatus::ChecksumError { offset } => {
                body.push(STATUS_CHECKSUM_ERROR);
                body.extend_from_slice(&offset.to_le_bytes());
            }
            AckStatus::Error(msg) => {
                body.push(STATUS_ERROR);
                body.extend_from_slice(&(msg.len() as u32).to_le_bytes());
                body.extend_from_slice(msg.as_bytes());
            }
        }
        body.extend_from_slice(&self.durable_length.to_le_bytes());
        encode_frame(KIND_ACK, &body)
    }

    /// Deserialize from a frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let body = decode_frame(bytes, KIND_ACK)?;
        let mut cursor = Cursor::new(body);

        let seqno = cursor.read_u64::<LittleEndian>()?;
        let status = match cursor.read_u8()? {
            STATUS_SUCCESS => AckStatus::Success,
            STATUS_CHECKSUM_ERROR => AckStatus::ChecksumError {
                offset: cursor.read_u64::<LittleEndian>()?,
            },
            STATUS_ERROR => {
                let len = cursor.read_u32::<LittleEndian>()? as usize;
                if len > body.len() {
                    return Err(FrameError::Truncated);
                }
                let mut msg = vec![0u8; len];
                cursor.read_exact(&mut msg)?;
                AckStatus::Error(
                    String::from_utf8(msg)
                        .map_err(|_| FrameError::InvalidField("ack message".to_string()))?,
                )
            }
            other => return Err(FrameError::InvalidField(format!("ack status {}", other))),
        };
        let durable_length = cursor.read_u64::<LittleEndian>()?;

        Ok(PacketAck {
            seqno,
            status,
            durable_length,
        })
    }
}
