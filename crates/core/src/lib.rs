//! Core types for Cascade
//!
//! This crate defines the vocabulary shared by every layer of the write
//! pipeline:
//! - Block, file and node identifiers
//! - Block descriptors handed out by the namespace (`LocatedBlock`)
//! - The error taxonomy (`CascadeError`, `PipelineFailure`)
//! - Pipeline configuration (`CascadeConfig`)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{CascadeConfig, ConfigError, CreateOptions, CONFIG_FILE_NAME};
pub use error::{CascadeError, CascadeResult, PipelineFailure};
pub use types::{
    BlockId, ChecksumKind, ExtendedBlock, FileId, GenerationStamp, LocatedBlock, NodeId,
    ReplicaLocation,
};
