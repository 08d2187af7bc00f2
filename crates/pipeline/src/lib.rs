//! Replicated write pipeline for Cascade
//!
//! This crate moves checksummed chunks from a writer to every replica of a
//! block and decides, per flush, whether the visibility watermark may move:
//!
//! - `VisibleLength`: the per-block watermark readers consult
//! - `ReplicaConnection`: ordered, reliable frame transport to one replica
//! - `ReplicaNode`: in-process replica acceptor, one receiver thread per
//!   connection, with fault hooks for tests
//! - `PipelineCoordinator`: fan-out of flush packets and min-aggregation of
//!   acknowledgements in pipeline order

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod node;
pub mod transport;
pub mod watermark;

pub use coordinator::{AckPolicy, FlushOutcome, PipelineCoordinator};
pub use node::{NodeHealth, ReplicaNode};
pub use transport::{LocalConnection, ReplicaConnection};
pub use watermark::VisibleLength;
