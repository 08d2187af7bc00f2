//! Durability layer for Cascade
//!
//! This crate handles everything that touches checksums or disk:
//!
//! - Checksums: per-chunk CRC32 / XXH3 / null verification
//! - Chunking: splitting block data into fixed-size verification chunks,
//!   carrying a trailing partial chunk across flushes
//! - Wire format: flush packets and replica acknowledgements
//! - On-disk replica format: block data file plus checksum meta file
//! - Replica writer: verified, fsynced appends with a durable-length watermark

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod chunker;
pub mod format;
pub mod replica;

pub use checksum::DataChecksum;
pub use chunker::{validate_chunks, ChecksumChunker, Chunk, ChunkBatch};
pub use format::{
    data_file_name, meta_file_name, parse_meta_file_name, AckStatus, BlockMetaHeader, FlushPacket,
    FrameError, MetaHeaderError, PacketAck, BLOCK_META_HEADER_SIZE, BLOCK_META_MAGIC, CHECKSUM_SIZE,
    FRAME_MAGIC,
};
pub use replica::{ReplicaState, ReplicaWriter};
