//! Namespace service: path to block mapping.
//!
//! The write path only needs a handful of namespace operations: create a
//! file, allocate its next block with a pipeline of replica locations,
//! record a block's final length, and complete the file. `NamespaceService`
//! is that seam; `LocalNamespace` is the in-memory implementation the local
//! cluster uses.
//!
//! The namespace only learns a block's length when the block is sealed.
//! The length of a block under construction is its visible length, which
//! lives with the writer and is consulted by the cluster.

use cascade_core::{
    BlockId, CascadeError, CascadeResult, ExtendedBlock, FileId, GenerationStamp, LocatedBlock,
    ReplicaLocation,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

/// First generation stamp handed out
const INITIAL_GENERATION_STAMP: u64 = 1000;

/// A block of a file as recorded by the namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Identity, file offset and pipeline order
    pub located: LocatedBlock,
    /// Final length, once sealed
    pub sealed_length: Option<u64>,
}

impl BlockRecord {
    /// Whether the block's length is final
    pub fn is_sealed(&self) -> bool {
        self.sealed_length.is_some()
    }
}

/// File metadata as recorded by the namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    /// Absolute path
    pub path: String,
    /// File identity
    pub file_id: FileId,
    /// Bytes in sealed blocks, or the final length once complete
    pub length: u64,
    /// Blocks allocated so far
    pub block_count: usize,
    /// Target block size
    pub block_size: u64,
    /// Replicas per block
    pub replication: usize,
    /// Whether the file has been closed
    pub complete: bool,
}

/// Namespace operations consumed by the write and read paths
pub trait NamespaceService: Send + Sync {
    /// Create `path`, replacing an existing file only if `overwrite`.
    fn create_file(
        &self,
        path: &str,
        block_size: u64,
        replication: usize,
        overwrite: bool,
    ) -> CascadeResult<FileId>;

    /// Allocate the next block of `file` and choose its pipeline.
    fn allocate_block(&self, file: FileId) -> CascadeResult<LocatedBlock>;

    /// Drop `file`'s last block before any data reached it, e.g. when its
    /// pipeline could not be set up.
    fn abandon_block(&self, file: FileId, block: BlockId) -> CascadeResult<()>;

    /// Record the final length of `file`'s last block.
    fn seal_block(&self, file: FileId, block: BlockId, length: u64) -> CascadeResult<()>;

    /// Mark `file` complete at `length`.
    ///
    /// Fails with `IncompleteFile` if a block is still open or `length`
    /// differs from the sum of sealed block lengths.
    fn complete_file(&self, file: FileId, length: u64) -> CascadeResult<()>;

    /// Status of `path`
    fn get_file_status(&self, path: &str) -> CascadeResult<FileStatus>;

    /// Blocks of `path` in file order
    fn get_block_locations(&self, path: &str) -> CascadeResult<Vec<BlockRecord>>;
}

#[derive(Debug)]
struct FileEntry {
    id: FileId,
    block_size: u64,
    replication: usize,
    blocks: Vec<BlockRecord>,
    complete: bool,
}

impl FileEntry {
    fn sealed_length(&self) -> u64 {
        self.blocks.iter().filter_map(|b| b.sealed_length).sum()
    }
}

#[derive(Debug, Default)]
struct NamespaceState {
    files: HashMap<String, FileEntry>,
    paths: HashMap<FileId, String>,
    next_file_id: u64,
    next_block_id: u64,
    next_generation_stamp: u64,
    placement_cursor: usize,
}

impl NamespaceState {
    fn file_mut(&mut self, file: FileId) -> CascadeResult<&mut FileEntry> {
        let path = self
            .paths
            .get(&file)
            .ok_or_else(|| CascadeError::FileNotFound(file.to_string()))?;
        self.files
            .get_mut(path)
            .ok_or_else(|| CascadeError::FileNotFound(path.clone()))
    }
}

/// In-memory namespace with round-robin replica placement
#[derive(Debug)]
pub struct LocalNamespace {
    nodes: Vec<ReplicaLocation>,
    state: RwLock<NamespaceState>,
}

impl LocalNamespace {
    /// Create a namespace placing replicas on `nodes`.
    pub fn new(nodes: Vec<ReplicaLocation>) -> Self {
        LocalNamespace {
            nodes,
            state: RwLock::new(NamespaceState {
                next_file_id: 1,
                next_block_id: 1,
                next_generation_stamp: INITIAL_GENERATION_STAMP,
                ..Default::default()
            }),
        }
    }

    /// Paths of every file, sorted
    pub fn list(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state.read().files.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl NamespaceService for LocalNamespace {
    fn create_file(
        &self,
        path: &str,
        block_size: u64,
        replication: usize,
        overwrite: bool,
    ) -> CascadeResult<FileId> {
        if block_size == 0 {
            return Err(CascadeError::InvalidConfig("block size must be non-zero".into()));
        }
        if replication == 0 || replication > self.nodes.len() {
            return Err(CascadeError::InvalidConfig(format!(
                "replication {} with {} nodes",
                replication,
                self.nodes.len()
            )));
        }

        let mut state = self.state.write();
        if let Some(old) = state.files.get(path).map(|e| e.id) {
            if !overwrite {
                return Err(CascadeError::FileExists(path.to_string()));
            }
            state.paths.remove(&old);
        }

        let id = FileId(state.next_file_id);
        state.next_file_id += 1;
        state.files.insert(
            path.to_string(),
            FileEntry {
                id,
                block_size,
                replication,
                blocks: Vec::new(),
                complete: false,
            },
        );
        state.paths.insert(id, path.to_string());
        info!(target: "cascade::namespace", path, file = %id, block_size, replication, "File created");
        Ok(id)
    }

    fn allocate_block(&self, file: FileId) -> CascadeResult<LocatedBlock> {
        let mut state = self.state.write();
        let block_id = BlockId(state.next_block_id);
        let generation_stamp = GenerationStamp(state.next_generation_stamp);
        let cursor = state.placement_cursor;

        let entry = state.file_mut(file)?;
        if entry.complete {
            return Err(CascadeError::invariant(format!(
                "allocating a block for completed {}",
                file
            )));
        }
        if entry.blocks.last().map_or(false, |b| !b.is_sealed()) {
            return Err(CascadeError::invariant(format!(
                "allocating a block for {} while its last block is open",
                file
            )));
        }

        let locations: Vec<ReplicaLocation> = (0..entry.replication)
            .map(|i| self.nodes[(cursor + i) % self.nodes.len()])
            .collect();
        let located = LocatedBlock {
            block: ExtendedBlock::new(block_id, generation_stamp),
            offset: entry.sealed_length(),
            locations,
        };
        entry.blocks.push(BlockRecord {
            located: located.clone(),
            sealed_length: None,
        });

        state.next_block_id += 1;
        state.next_generation_stamp += 1;
        state.placement_cursor = (cursor + 1) % self.nodes.len();

        debug!(
            target: "cascade::namespace",
            file = %file,
            block = %located.block,
            offset = located.offset,
            "Block allocated"
        );
        Ok(located)
    }

    fn abandon_block(&self, file: FileId, block: BlockId) -> CascadeResult<()> {
        let mut state = self.state.write();
        let entry = state.file_mut(file)?;
        let open_last = entry
            .blocks
            .last()
            .map_or(false, |b| b.located.block.id == block && !b.is_sealed());
        if !open_last {
            return Err(CascadeError::invariant(format!(
                "{} is not the open last block of {}",
                block, file
            )));
        }
        entry.blocks.pop();
        debug!(target: "cascade::namespace", file = %file, block = %block, "Block abandoned");
        Ok(())
    }

    fn seal_block(&self, file: FileId, block: BlockId, length: u64) -> CascadeResult<()> {
        let mut state = self.state.write();
        let entry = state.file_mut(file)?;
        let block_size = entry.block_size;
        let record = entry
            .blocks
            .last_mut()
            .filter(|b| b.located.block.id == block)
            .ok_or_else(|| {
                CascadeError::invariant(format!("{} is not the last block of {}", block, file))
            })?;
        if length > block_size {
            return Err(CascadeError::invariant(format!(
                "sealing {} at {} beyond block size {}",
                block, length, block_size
            )));
        }
        match record.sealed_length {
            Some(sealed) if sealed == length => Ok(()),
            Some(sealed) => Err(CascadeError::invariant(format!(
                "{} already sealed at {}, not {}",
                block, sealed, length
            ))),
            None => {
                record.sealed_length = Some(length);
                debug!(target: "cascade::namespace", file = %file, block = %block, length, "Block sealed");
                Ok(())
            }
        }
    }

    fn complete_file(&self, file: FileId, length: u64) -> CascadeResult<()> {
        let mut state = self.state.write();
        let entry = state.file_mut(file)?;
        if entry.blocks.iter().any(|b| !b.is_sealed()) {
            return Err(CascadeError::IncompleteFile(format!(
                "{} has an open block",
                file
            )));
        }
        let sealed = entry.sealed_length();
        if sealed != length {
            return Err(CascadeError::IncompleteFile(format!(
                "{} closing at {} but sealed blocks hold {}",
                file, length, sealed
            )));
        }
        entry.complete = true;
        Ok(())
    }

    fn get_file_status(&self, path: &str) -> CascadeResult<FileStatus> {
        let state = self.state.read();
        let entry = state
            .files
            .get(path)
            .ok_or_else(|| CascadeError::FileNotFound(path.to_string()))?;
        Ok(FileStatus {
            path: path.to_string(),
            file_id: entry.id,
            length: entry.sealed_length(),
            block_count: entry.blocks.len(),
            block_size: entry.block_size,
            replication: entry.replication,
            complete: entry.complete,
        })
    }

    fn get_block_locations(&self, path: &str) -> CascadeResult<Vec<BlockRecord>> {
        let state = self.state.read();
        state
            .files
            .get(path)
            .map(|entry| entry.blocks.clone())
            .ok_or_else(|| CascadeError::FileNotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::NodeId;

    fn location(node: u32) -> ReplicaLocation {
        ReplicaLocation {
            node_id: NodeId(node),
            storage_id: Default::default(),
        }
    }

    fn namespace(nodes: u32) -> LocalNamespace {
        LocalNamespace::new((0..nodes).map(location).collect())
    }

    #[test]
    fn test_create_and_status() {
        let ns = namespace(3);
        let id = ns.create_file("/a", 1024, 2, false).unwrap();
        let status = ns.get_file_status("/a").unwrap();
        assert_eq!(status.file_id, id);
        assert_eq!(status.length, 0);
        assert_eq!(status.block_count, 0);
        assert!(!status.complete);
    }

    #[test]
    fn test_create_existing_requires_overwrite() {
        let ns = namespace(1);
        ns.create_file("/a", 1024, 1, false).unwrap();
        assert!(matches!(
            ns.create_file("/a", 1024, 1, false),
            Err(CascadeError::FileExists(_))
        ));
        let replaced = ns.create_file("/a", 1024, 1, true).unwrap();
        assert_eq!(ns.get_file_status("/a").unwrap().file_id, replaced);
        assert_eq!(ns.list(), vec!["/a".to_string()]);
    }

    #[test]
    fn test_replication_limited_by_nodes() {
        let ns = namespace(2);
        assert!(matches!(
            ns.create_file("/a", 1024, 3, false),
            Err(CascadeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_allocate_seal_complete() {
        let ns = namespace(3);
        let id = ns.create_file("/f", 100, 2, false).unwrap();

        let first = ns.allocate_block(id).unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.locations.len(), 2);
        assert!(ns.allocate_block(id).is_err());

        ns.seal_block(id, first.block.id, 100).unwrap();
        ns.seal_block(id, first.block.id, 100).unwrap();
        let second = ns.allocate_block(id).unwrap();
        assert_eq!(second.offset, 100);
        assert_ne!(second.block.id, first.block.id);
        assert!(second.block.generation_stamp > first.block.generation_stamp);
        assert_ne!(second.locations[0], first.locations[0]);

        assert!(matches!(
            ns.complete_file(id, 140),
            Err(CascadeError::IncompleteFile(_))
        ));
        ns.seal_block(id, second.block.id, 40).unwrap();
        assert!(ns.complete_file(id, 120).is_err());
        ns.complete_file(id, 140).unwrap();

        let status = ns.get_file_status("/f").unwrap();
        assert_eq!(status.length, 140);
        assert_eq!(status.block_count, 2);
        assert!(status.complete);
        assert!(ns.allocate_block(id).is_err());
    }

    #[test]
    fn test_abandon_block() {
        let ns = namespace(2);
        let id = ns.create_file("/f", 100, 2, false).unwrap();
        let b = ns.allocate_block(id).unwrap();
        ns.abandon_block(id, b.block.id).unwrap();
        assert_eq!(ns.get_file_status("/f").unwrap().block_count, 0);
        assert!(ns.abandon_block(id, b.block.id).is_err());

        let again = ns.allocate_block(id).unwrap();
        assert_eq!(again.offset, 0);
        assert_ne!(again.block.id, b.block.id);
    }

    #[test]
    fn test_seal_beyond_block_size_rejected() {
        let ns = namespace(1);
        let id = ns.create_file("/f", 100, 1, false).unwrap();
        let b = ns.allocate_block(id).unwrap();
        assert!(ns.seal_block(id, b.block.id, 101).unwrap_err().is_fatal());
    }

    #[test]
    fn test_missing_file() {
        let ns = namespace(1);
        assert!(matches!(
            ns.get_block_locations("/nope"),
            Err(CascadeError::FileNotFound(_))
        ));
        assert!(ns.allocate_block(FileId(99)).is_err());
    }
}
