//! Cascade - replicated block storage with incremental flush-to-visibility
//!
//! A file is written as a sequence of blocks, each replicated through an
//! ordered pipeline of replica nodes. `hflush` pushes everything written so
//! far through the pipeline and, once every replica has it on disk, makes it
//! visible to readers without closing the file.
//!
//! # Quick Start
//!
//! ```ignore
//! use cascadefs::{CascadeConfig, CreateOptions, LocalCluster};
//!
//! let cluster = LocalCluster::builder()
//!     .config(CascadeConfig::for_testing())
//!     .build()?;
//!
//! let mut out = cluster.create("/events", CreateOptions::new())?;
//! out.write(b"first record\n")?;
//! out.hflush()?;
//!
//! // A reader opened now sees the flushed bytes
//! let reader = cluster.open("/events")?;
//! assert_eq!(reader.read(0, 13)?, b"first record\n");
//!
//! out.close()?;
//! ```
//!
//! # Architecture
//!
//! | Layer | Crate |
//! |-------|-------|
//! | identifiers, errors, configuration | `cascade-core` |
//! | checksums, chunking, wire and disk formats, replica writer | `cascade-durability` |
//! | visibility watermark, replica nodes, pipeline coordinator | `cascade-pipeline` |
//! | namespace, write sessions, reader, local cluster | `cascade-engine` |

pub use cascade_core::{
    BlockId, CascadeConfig, CascadeError, CascadeResult, ChecksumKind, ConfigError, CreateOptions,
    ExtendedBlock, FileId, GenerationStamp, LocatedBlock, NodeId, PipelineFailure,
    ReplicaLocation, CONFIG_FILE_NAME,
};
pub use cascade_durability::{ChecksumChunker, Chunk, ChunkBatch, DataChecksum, ReplicaWriter};
pub use cascade_engine::{
    BlockRecord, BlockState, BlockWriteSession, ExcludedReplica, FileStatus, FileWriteSession, LocalCluster,
    LocalClusterBuilder, LocalNamespace, NamespaceService, SealedBlock, VisibleLengthReader,
};
pub use cascade_pipeline::{
    AckPolicy, FlushOutcome, NodeHealth, PipelineCoordinator, ReplicaConnection, ReplicaNode,
    VisibleLength,
};
