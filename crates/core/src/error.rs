//! Error types for Cascade
//!
//! One error enum covers every layer. We use `thiserror` for automatic
//! `Display` and `Error` trait implementations.
//!
//! # Taxonomy
//!
//! | Variant | Cause | Retry? |
//! |---------|-------|--------|
//! | `Corruption` | checksum mismatch on append or read | no, data is bad |
//! | `Pipeline` | a replica failed during a flush | yes, buffer is retained |
//! | `InvariantViolation` | programming error (write after seal, chunk misuse) | no, fatal to the session |
//! | `IncompleteFile` | close could not account for every written byte | no |

use crate::types::{BlockId, NodeId};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Cascade operations
pub type CascadeResult<T> = std::result::Result<T, CascadeError>;

/// Why a single replica failed to acknowledge a flush
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineFailure {
    /// The replica found a checksum mismatch in the data it received
    #[error("checksum mismatch at block offset {offset}")]
    ChecksumMismatch {
        /// Block offset of the first bad chunk
        offset: u64,
    },

    /// The replica's connection is closed or could not be opened
    #[error("replica unreachable")]
    Unreachable,

    /// No acknowledgement arrived before the flush deadline
    #[error("no acknowledgement after {waited:?}")]
    TimedOut {
        /// How long the coordinator waited
        waited: Duration,
    },

    /// The replica refused the packet
    #[error("rejected: {0}")]
    Rejected(String),

    /// Too few replicas acknowledged to satisfy the ack policy
    #[error("only {acked} of {required} required replicas acknowledged")]
    InsufficientAcks {
        /// Replicas that acknowledged
        acked: usize,
        /// Replicas the policy requires
        required: usize,
    },
}

/// Error types for Cascade
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Checksum verification failed
    #[error("Data corruption in {block_id} at offset {offset}: {detail}")]
    Corruption {
        /// Block that failed verification
        block_id: BlockId,
        /// Block offset of the failing chunk
        offset: u64,
        /// Human-readable description
        detail: String,
    },

    /// A flush could not be acknowledged by the pipeline
    ///
    /// Visible length is unchanged and the writer keeps its buffer.
    #[error("Pipeline error at replica {replica_index} ({node}): {reason}")]
    Pipeline {
        /// Index (in pipeline order) of the first failing replica
        replica_index: usize,
        /// Node holding that replica
        node: NodeId,
        /// What went wrong
        reason: PipelineFailure,
    },

    /// Internal invariant broken by the caller or by a component
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A file was closed without every written byte being accounted for
    #[error("Incomplete file: {0}")]
    IncompleteFile(String),

    /// I/O error (file operations, channels, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No such file in the namespace
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// File already exists and overwrite was not requested
    #[error("File already exists: {0}")]
    FileExists(String),

    /// Operation on a session or cluster that has been shut down
    #[error("Closed: {0}")]
    Closed(String),
}

impl CascadeError {
    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        CascadeError::InvariantViolation(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(block_id: BlockId, offset: u64, detail: impl Into<String>) -> Self {
        CascadeError::Corruption {
            block_id,
            offset,
            detail: detail.into(),
        }
    }

    /// Create a pipeline error for the replica at `replica_index`
    pub fn pipeline(replica_index: usize, node: NodeId, reason: PipelineFailure) -> Self {
        CascadeError::Pipeline {
            replica_index,
            node,
            reason,
        }
    }

    /// Whether the caller may retry the operation with the same input
    ///
    /// Only pipeline failures are retryable: the writer's buffer was kept
    /// and visible length did not move.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CascadeError::Pipeline { .. })
    }

    /// Whether the error ends the session that raised it
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CascadeError::InvariantViolation(_) | CascadeError::IncompleteFile(_)
        )
    }

    /// Index of the failing replica, for pipeline errors
    pub fn failed_replica(&self) -> Option<usize> {
        match self {
            CascadeError::Pipeline { replica_index, .. } => Some(*replica_index),
            _ => None,
        }
    }
}

impl From<CascadeError> for io::Error {
    fn from(e: CascadeError) -> Self {
        match e {
            CascadeError::Io(inner) => inner,
            CascadeError::Corruption { .. } => io::Error::new(io::ErrorKind::InvalidData, e),
            CascadeError::FileNotFound(_) => io::Error::new(io::ErrorKind::NotFound, e),
            CascadeError::FileExists(_) => io::Error::new(io::ErrorKind::AlreadyExists, e),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_io_error_keeps_kind() {
        let err: io::Error = CascadeError::corruption(BlockId(1), 0, "bad").into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err: io::Error = CascadeError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "x")).into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_error_display_corruption() {
        let err = CascadeError::corruption(BlockId(3), 512, "crc mismatch");
        let msg = err.to_string();
        assert!(msg.contains("Data corruption"));
        assert!(msg.contains("blk_3"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_error_display_pipeline() {
        let err = CascadeError::pipeline(1, NodeId(4), PipelineFailure::Unreachable);
        let msg = err.to_string();
        assert!(msg.contains("replica 1"));
        assert!(msg.contains("node-4"));
        assert!(msg.contains("unreachable"));
    }

    #[test]
    fn test_pipeline_errors_are_retryable() {
        let err = CascadeError::pipeline(
            0,
            NodeId(1),
            PipelineFailure::TimedOut {
                waited: Duration::from_millis(10),
            },
        );
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert_eq!(err.failed_replica(), Some(0));
    }

    #[test]
    fn test_invariant_violation_is_fatal() {
        let err = CascadeError::invariant("write after seal");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.failed_replica(), None);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: CascadeError = io_err.into();
        assert!(matches!(err, CascadeError::Io(_)));
    }
}
