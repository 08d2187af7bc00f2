//! Shared test utilities for the integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use cascadefs::{CascadeConfig, CreateOptions, FileWriteSession, LocalCluster};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Once;

/// Block size used by the standard scenarios
pub const BLOCK_SIZE: u64 = 4096;

/// File size used by the standard scenarios: several blocks plus a tail
/// that is not a multiple of anything interesting
pub const FILE_SIZE: usize = 11 * BLOCK_SIZE as usize + 123;

/// Seed for deterministic file content
pub const SEED: u64 = 0x5EED_F00D;

static INIT_TRACING: Once = Once::new();

/// Install a test-writer tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic pseudo-random file content
pub fn init_buffer(size: usize) -> Vec<u8> {
    init_buffer_seeded(size, SEED)
}

/// Deterministic pseudo-random content from `seed`
pub fn init_buffer_seeded(size: usize, seed: u64) -> Vec<u8> {
    let mut buffer = vec![0u8; size];
    StdRng::seed_from_u64(seed).fill_bytes(&mut buffer);
    buffer
}

/// Start a cluster with `replicas` nodes, blocks of `block_size` bytes and
/// checksum chunks of `bytes_per_checksum` bytes.
pub fn start_cluster(block_size: u64, bytes_per_checksum: u32, replicas: usize) -> LocalCluster {
    init_tracing();
    let config = CascadeConfig::for_testing()
        .with_block_size(block_size)
        .with_bytes_per_checksum(bytes_per_checksum)
        .with_replication(replicas);
    LocalCluster::builder()
        .config(config)
        .nodes(replicas)
        .build()
        .expect("cluster should start")
}

/// Create `path` with an explicit block size and replication.
pub fn create(cluster: &LocalCluster, path: &str, block_size: u64, replicas: usize) -> FileWriteSession {
    cluster
        .create(
            path,
            CreateOptions::new()
                .block_size(block_size)
                .replication(replicas),
        )
        .expect("create should succeed")
}

/// Assert that `expected[from..from + actual.len()]` equals `actual`,
/// naming the first differing byte.
pub fn check_data(actual: &[u8], from: usize, expected: &[u8], message: &str) {
    for (idx, byte) in actual.iter().enumerate() {
        assert_eq!(
            expected[from + idx],
            *byte,
            "{} byte {} differs. expected {} actual {}",
            message,
            from + idx,
            expected[from + idx],
            byte
        );
    }
}

/// Read the whole of `path` with a fresh reader and compare it with
/// `expected`.
pub fn check_full_file(cluster: &LocalCluster, path: &str, expected: &[u8], message: &str) {
    let reader = cluster.open(path).expect("open should succeed");
    let actual = reader
        .read(0, expected.len() as u64 + 1)
        .expect("full read should succeed");
    assert_eq!(
        actual.len(),
        expected.len(),
        "{}: read {} bytes, expected {}",
        message,
        actual.len(),
        expected.len()
    );
    check_data(&actual, 0, expected, message);
}
