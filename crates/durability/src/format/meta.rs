//! Block replica on-disk layout.
//!
//! Each replica is two files in the node's storage directory:
//!
//! - `blk_<id>`: raw block bytes
//! - `blk_<id>_<genstamp>.meta`: header followed by one checksum per chunk
//!
//! # Meta file layout
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Header (12 bytes)                        │
//! │   magic "CSCM" (4) | version (2)         │
//! │   checksum kind (1) | reserved (1)       │
//! │   bytes per chunk (4)                    │
//! ├──────────────────────────────────────────┤
//! │ checksum of chunk 0 (4, LE)              │
//! │ checksum of chunk 1 (4, LE)              │
//! │ ...                                      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The checksum of chunk `i` lives at `BLOCK_META_HEADER_SIZE + 4 * i`, so a
//! trailing partial chunk's checksum can be overwritten in place when the
//! chunk grows.

use crate::checksum::DataChecksum;
use cascade_core::{BlockId, ChecksumKind, ExtendedBlock, GenerationStamp};

/// Magic bytes identifying a block meta file: "CSCM"
pub const BLOCK_META_MAGIC: [u8; 4] = *b"CSCM";

/// Current meta format version
pub const BLOCK_META_VERSION: u16 = 1;

/// Size of the meta header in bytes
pub const BLOCK_META_HEADER_SIZE: usize = 12;

/// Size of one stored checksum
pub const CHECKSUM_SIZE: usize = 4;

/// Name of a block's data file
pub fn data_file_name(block_id: BlockId) -> String {
    format!("{}", block_id)
}

/// Name of a block's checksum meta file
pub fn meta_file_name(block: &ExtendedBlock) -> String {
    format!("{}.meta", block)
}

/// Block named by a meta file name; `None` for any other file
pub fn parse_meta_file_name(name: &str) -> Option<ExtendedBlock> {
    let stem = name.strip_prefix("blk_")?.strip_suffix(".meta")?;
    let (id, stamp) = stem.split_once('_')?;
    Some(ExtendedBlock::new(
        BlockId(id.parse().ok()?),
        GenerationStamp(stamp.parse().ok()?),
    ))
}

/// Meta file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMetaHeader {
    /// Format version
    pub version: u16,
    /// Checksum geometry used for every chunk of the block
    pub checksum: DataChecksum,
}

impl BlockMetaHeader {
    /// Header for a new replica
    pub fn new(checksum: DataChecksum) -> Self {
        BlockMetaHeader {
            version: BLOCK_META_VERSION,
            checksum,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; BLOCK_META_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_META_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&BLOCK_META_MAGIC);
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[6] = self.checksum.kind().to_byte();
        bytes[8..12].copy_from_slice(&self.checksum.bytes_per_chunk().to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; BLOCK_META_HEADER_SIZE]) -> Result<Self, MetaHeaderError> {
        if bytes[0..4] != BLOCK_META_MAGIC {
            return Err(MetaHeaderError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != BLOCK_META_VERSION {
            return Err(MetaHeaderError::UnsupportedVersion(version));
        }
        let kind =
            ChecksumKind::from_byte(bytes[6]).ok_or(MetaHeaderError::UnknownChecksum(bytes[6]))?;
        let bytes_per_chunk = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let checksum = DataChecksum::new(kind, bytes_per_chunk)
            .map_err(|_| MetaHeaderError::ZeroChunkSize)?;
        Ok(BlockMetaHeader { version, checksum })
    }

    /// File offset of the checksum for chunk `index`
    pub fn checksum_position(index: u64) -> u64 {
        BLOCK_META_HEADER_SIZE as u64 + index * CHECKSUM_SIZE as u64
    }
}

/// Meta header decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetaHeaderError {
    /// Wrong magic bytes
    #[error("Invalid meta file magic bytes")]
    BadMagic,
    /// Unknown format version
    #[error("Unsupported meta file version {0}")]
    UnsupportedVersion(u16),
    /// Unknown checksum tag
    #[error("Unknown checksum kind {0}")]
    UnknownChecksum(u8),
    /// Chunk size of zero
    #[error("Meta header declares a zero chunk size")]
    ZeroChunkSize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::GenerationStamp;

    #[test]
    fn test_file_names() {
        let block = ExtendedBlock::new(BlockId(42), GenerationStamp(1001));
        assert_eq!(data_file_name(block.id), "blk_42");
        assert_eq!(meta_file_name(&block), "blk_42_1001.meta");
    }

    #[test]
    fn test_parse_meta_file_name() {
        let block = ExtendedBlock::new(BlockId(42), GenerationStamp(1001));
        assert_eq!(parse_meta_file_name(&meta_file_name(&block)), Some(block));
        assert_eq!(parse_meta_file_name("blk_42"), None);
        assert_eq!(parse_meta_file_name("blk_42.meta"), None);
        assert_eq!(parse_meta_file_name("blk_x_1.meta"), None);
        assert_eq!(parse_meta_file_name("cascade.toml"), None);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = BlockMetaHeader::new(DataChecksum::new(ChecksumKind::Xxh3, 400).unwrap());
        let parsed = BlockMetaHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_bad_magic() {
        let mut bytes = BlockMetaHeader::new(DataChecksum::crc32(512).unwrap()).to_bytes();
        bytes[0] = b'Z';
        assert_eq!(
            BlockMetaHeader::from_bytes(&bytes),
            Err(MetaHeaderError::BadMagic)
        );
    }

    #[test]
    fn test_checksum_position() {
        assert_eq!(BlockMetaHeader::checksum_position(0), 12);
        assert_eq!(BlockMetaHeader::checksum_position(3), 24);
    }
}
