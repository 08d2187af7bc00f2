//! Client-facing write and read sessions for Cascade
//!
//! - `BlockWriteSession`: one block, buffered writes, `hflush`, `seal`
//! - `FileWriteSession`: a file spanning blocks, with lazy block rollover
//! - `VisibleLengthReader`: reads bounded by what writers have made visible
//! - `NamespaceService` / `LocalNamespace`: path to block mapping
//! - `LocalCluster`: in-process nodes plus namespace, the entry point

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block_session;
pub mod cluster;
pub mod file_session;
pub mod namespace;
pub mod reader;

pub use block_session::{BlockState, BlockWriteSession, ExcludedReplica};
pub use cluster::{LocalCluster, LocalClusterBuilder};
pub use file_session::{FileWriteSession, SealedBlock};
pub use namespace::{BlockRecord, FileStatus, LocalNamespace, NamespaceService};
pub use reader::VisibleLengthReader;
