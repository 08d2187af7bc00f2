//! Binary formats
//!
//! - `packet`: flush packets and acknowledgements exchanged with replicas
//! - `meta`: per-block checksum meta file header and file naming

pub mod meta;
pub mod packet;

pub use meta::{
    data_file_name, meta_file_name, parse_meta_file_name, BlockMetaHeader, MetaHeaderError,
    BLOCK_META_HEADER_SIZE, BLOCK_META_MAGIC, BLOCK_META_VERSION, CHECKSUM_SIZE,
};
pub use packet::{AckStatus, FlushPacket, FrameError, PacketAck, FRAME_MAGIC, FRAME_VERSION};
