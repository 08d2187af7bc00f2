//! Pipeline configuration via `cascade.toml`
//!
//! The write pipeline consumes four settings: block size, checksum chunk
//! size, replication factor and flush timeout. The remaining fields tune
//! the ack policy, the checksum algorithm and packet sizing.
//!
//! Configuration can be built in code with the `with_*` builders or read
//! from a TOML file. Either way, call `validate()` before use.

use crate::error::CascadeError;
use crate::types::ChecksumKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the cluster base directory.
pub const CONFIG_FILE_NAME: &str = "cascade.toml";

/// Pipeline configuration.
///
/// # Example
///
/// ```toml
/// block_size = 67108864
/// bytes_per_checksum = 512
/// replication = 3
/// flush_timeout_ms = 30000
/// checksum = "crc32"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Target block size in bytes (default: 64MB)
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Checksum chunk size in bytes (default: 512)
    ///
    /// Independent of `block_size`: it need not divide it.
    #[serde(default = "default_bytes_per_checksum")]
    pub bytes_per_checksum: u32,

    /// Replicas per block (default: 3)
    #[serde(default = "default_replication")]
    pub replication: usize,

    /// How long a flush waits for acknowledgements (default: 30s)
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Minimum replicas that must acknowledge a flush.
    ///
    /// `None` (the default) means every replica in the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_acks: Option<usize>,

    /// Checksum algorithm (default: crc32)
    #[serde(default)]
    pub checksum: ChecksumKind,

    /// Upper bound on chunk payload bytes per packet (default: 64KB)
    #[serde(default = "default_write_packet_size")]
    pub write_packet_size: u32,
}

fn default_block_size() -> u64 {
    64 * 1024 * 1024
}

fn default_bytes_per_checksum() -> u32 {
    512
}

fn default_replication() -> usize {
    3
}

fn default_flush_timeout_ms() -> u64 {
    30_000
}

fn default_write_packet_size() -> u32 {
    64 * 1024
}

impl Default for CascadeConfig {
    fn default() -> Self {
        CascadeConfig {
            block_size: default_block_size(),
            bytes_per_checksum: default_bytes_per_checksum(),
            replication: default_replication(),
            flush_timeout_ms: default_flush_timeout_ms(),
            min_acks: None,
            checksum: ChecksumKind::default(),
            write_packet_size: default_write_packet_size(),
        }
    }
}

impl CascadeConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration for testing (small blocks, two replicas).
    pub fn for_testing() -> Self {
        CascadeConfig {
            block_size: 4096,
            bytes_per_checksum: 512,
            replication: 2,
            flush_timeout_ms: 5_000,
            ..Default::default()
        }
    }

    /// Set block size (builder pattern).
    pub fn with_block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    /// Set checksum chunk size (builder pattern).
    pub fn with_bytes_per_checksum(mut self, bytes: u32) -> Self {
        self.bytes_per_checksum = bytes;
        self
    }

    /// Set replication factor (builder pattern).
    pub fn with_replication(mut self, replication: usize) -> Self {
        self.replication = replication;
        self
    }

    /// Set flush timeout (builder pattern).
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Opt in to partial acknowledgement (builder pattern).
    pub fn with_min_acks(mut self, min_acks: usize) -> Self {
        self.min_acks = Some(min_acks);
        self
    }

    /// Set checksum algorithm (builder pattern).
    pub fn with_checksum(mut self, kind: ChecksumKind) -> Self {
        self.checksum = kind;
        self
    }

    /// Set packet payload size (builder pattern).
    pub fn with_write_packet_size(mut self, size: u32) -> Self {
        self.write_packet_size = size;
        self
    }

    /// Flush timeout as a `Duration`.
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Replicas that must acknowledge a flush for a pipeline of `pipeline_len`.
    pub fn required_acks(&self, pipeline_len: usize) -> usize {
        match self.min_acks {
            Some(min) => min.min(pipeline_len),
            None => pipeline_len,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.bytes_per_checksum == 0 {
            return Err(ConfigError::ZeroChecksumChunk);
        }
        if self.replication == 0 {
            return Err(ConfigError::ZeroReplication);
        }
        if self.flush_timeout_ms == 0 {
            return Err(ConfigError::ZeroFlushTimeout);
        }
        if let Some(min) = self.min_acks {
            if min == 0 || min > self.replication {
                return Err(ConfigError::InvalidMinAcks {
                    min_acks: min,
                    replication: self.replication,
                });
            }
        }
        if self.write_packet_size < self.bytes_per_checksum {
            return Err(ConfigError::PacketSmallerThanChunk);
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Cascade pipeline configuration
#
# Target block size in bytes. A file is a sequence of blocks.
block_size = 67108864

# Checksum chunk size in bytes. Need not divide block_size.
bytes_per_checksum = 512

# Replicas per block (pipeline length).
replication = 3

# How long hflush waits for every replica before failing (milliseconds).
flush_timeout_ms = 30000

# Checksum algorithm: "crc32" (default), "xxh3" or "null".
checksum = "crc32"

# Upper bound on chunk bytes carried by one packet.
write_packet_size = 65536

# Accept a flush once this many replicas acknowledge.
# Unset (the default) requires every replica.
# min_acks = 2
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("'{}': {}", path.display(), e)))?;
        let config: CascadeConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("'{}': {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::Write(format!("'{}': {}", path.display(), e)))
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())
                .map_err(|e| ConfigError::Write(format!("'{}': {}", path.display(), e)))?;
        }
        Ok(())
    }
}

/// Per-file overrides supplied at create time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Replicas for this file's blocks (cluster default when `None`)
    pub replication: Option<usize>,
    /// Block size for this file (cluster default when `None`)
    pub block_size: Option<u64>,
    /// Replace an existing file of the same name
    pub overwrite: bool,
}

impl CreateOptions {
    /// Options that inherit every cluster default
    pub fn new() -> Self {
        Self::default()
    }

    /// Set replication (builder pattern).
    pub fn replication(mut self, replication: usize) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Set block size (builder pattern).
    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Allow replacing an existing file (builder pattern).
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Apply these overrides on top of a cluster configuration.
    pub fn apply(&self, base: &CascadeConfig) -> CascadeConfig {
        let mut config = base.clone();
        if let Some(replication) = self.replication {
            config.replication = replication;
            if let Some(min) = config.min_acks {
                config.min_acks = Some(min.min(replication));
            }
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        config
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Block size is zero
    #[error("block_size must be greater than zero")]
    ZeroBlockSize,

    /// Checksum chunk size is zero
    #[error("bytes_per_checksum must be greater than zero")]
    ZeroChecksumChunk,

    /// Replication is zero
    #[error("replication must be at least 1")]
    ZeroReplication,

    /// Flush timeout is zero
    #[error("flush_timeout_ms must be greater than zero")]
    ZeroFlushTimeout,

    /// `min_acks` outside `1..=replication`
    #[error("min_acks {min_acks} must be between 1 and replication ({replication})")]
    InvalidMinAcks {
        /// Configured minimum
        min_acks: usize,
        /// Configured replication
        replication: usize,
    },

    /// A packet must fit at least one full chunk
    #[error("write_packet_size cannot be smaller than bytes_per_checksum")]
    PacketSmallerThanChunk,

    /// Config file could not be read
    #[error("Failed to read config file {0}")]
    Read(String),

    /// Config file could not be written
    #[error("Failed to write config file {0}")]
    Write(String),

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config file {0}")]
    Parse(String),

    /// Config could not be rendered as TOML
    #[error("Failed to serialize config: {0}")]
    Serialize(String),
}

impl From<ConfigError> for CascadeError {
    fn from(e: ConfigError) -> Self {
        CascadeError::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = CascadeConfig::default();
        assert_eq!(config.block_size, 64 * 1024 * 1024);
        assert_eq!(config.bytes_per_checksum, 512);
        assert_eq!(config.replication, 3);
        assert_eq!(config.min_acks, None);
        assert_eq!(config.checksum, ChecksumKind::Crc32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = CascadeConfig::new()
            .with_block_size(1200)
            .with_bytes_per_checksum(400)
            .with_replication(2)
            .with_flush_timeout(Duration::from_secs(2))
            .with_checksum(ChecksumKind::Xxh3);

        assert_eq!(config.block_size, 1200);
        assert_eq!(config.bytes_per_checksum, 400);
        assert_eq!(config.replication, 2);
        assert_eq!(config.flush_timeout(), Duration::from_secs(2));
        assert_eq!(config.checksum, ChecksumKind::Xxh3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_need_not_divide_block() {
        let config = CascadeConfig::for_testing()
            .with_block_size(1000)
            .with_bytes_per_checksum(400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_sizes() {
        assert_eq!(
            CascadeConfig::new().with_block_size(0).validate(),
            Err(ConfigError::ZeroBlockSize)
        );
        assert_eq!(
            CascadeConfig::new().with_bytes_per_checksum(0).validate(),
            Err(ConfigError::ZeroChecksumChunk)
        );
        assert_eq!(
            CascadeConfig::new().with_replication(0).validate(),
            Err(ConfigError::ZeroReplication)
        );
    }

    #[test]
    fn test_validation_min_acks_range() {
        let config = CascadeConfig::new().with_replication(2).with_min_acks(3);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMinAcks { .. })
        ));
        let config = CascadeConfig::new().with_replication(3).with_min_acks(2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_required_acks() {
        let all = CascadeConfig::new();
        assert_eq!(all.required_acks(3), 3);
        let partial = CascadeConfig::new().with_min_acks(2);
        assert_eq!(partial.required_acks(3), 2);
        assert_eq!(partial.required_acks(1), 1);
    }

    #[test]
    fn test_create_options_override() {
        let base = CascadeConfig::new().with_min_acks(3);
        let config = CreateOptions::new().replication(2).block_size(1536).apply(&base);
        assert_eq!(config.replication, 2);
        assert_eq!(config.block_size, 1536);
        assert_eq!(config.min_acks, Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_toml_parses_to_defaults() {
        let config: CascadeConfig = toml::from_str(CascadeConfig::default_toml()).unwrap();
        assert_eq!(config, CascadeConfig::default());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: CascadeConfig =
            toml::from_str("block_size = 1536\nbytes_per_checksum = 512\n").unwrap();
        assert_eq!(config.block_size, 1536);
        assert_eq!(config.replication, 3);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let config = CascadeConfig::for_testing().with_min_acks(1);
        config.write_to_file(&path).unwrap();

        let loaded = CascadeConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        std::fs::write(&path, "replication = 2\n").unwrap();
        CascadeConfig::write_default_if_missing(&path).unwrap();

        let config = CascadeConfig::from_file(&path).unwrap();
        assert_eq!(config.replication, 2);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "replication = 0\n").unwrap();
        assert_eq!(
            CascadeConfig::from_file(&path),
            Err(ConfigError::ZeroReplication)
        );
    }
}
