//! In-process cluster: replica nodes, namespace and client entry points.
//!
//! `LocalCluster` wires a set of `ReplicaNode`s to a `LocalNamespace` and
//! hands out write sessions and readers that share one `ClusterContext`.
//! Node storage lives in a temporary directory unless a directory is given.
//!
//! ```ignore
//! let cluster = LocalCluster::builder()
//!     .config(CascadeConfig::for_testing())
//!     .nodes(3)
//!     .build()?;
//!
//! let mut out = cluster.create("/logs/app", CreateOptions::new())?;
//! out.write(b"event")?;
//! out.hflush()?;                       // visible to new readers now
//! let reader = cluster.open("/logs/app")?;
//! assert_eq!(reader.read(0, 5)?, b"event");
//! out.close()?;
//! ```

use cascade_core::{
    BlockId, CascadeConfig, CascadeError, CascadeResult, CreateOptions, NodeId, CONFIG_FILE_NAME,
};
use cascade_pipeline::{ReplicaNode, VisibleLength};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

use crate::file_session::FileWriteSession;
use crate::namespace::{FileStatus, LocalNamespace, NamespaceService};
use crate::reader::VisibleLengthReader;

/// State shared by the cluster, its write sessions and its readers
pub(crate) struct ClusterContext {
    pub(crate) namespace: Arc<dyn NamespaceService>,
    nodes: HashMap<NodeId, Arc<ReplicaNode>>,
    watermarks: DashMap<BlockId, Arc<VisibleLength>>,
    open: AtomicBool,
}

impl ClusterContext {
    pub(crate) fn node(&self, id: NodeId) -> CascadeResult<Arc<ReplicaNode>> {
        self.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| CascadeError::invariant(format!("unknown {}", id)))
    }

    pub(crate) fn register_watermark(&self, block: BlockId, watermark: Arc<VisibleLength>) {
        self.watermarks.insert(block, watermark);
    }

    /// Forget a block's watermark once the namespace holds its sealed
    /// length.
    pub(crate) fn retire_watermark(&self, block: BlockId) {
        self.watermarks.remove(&block);
    }

    /// Visible length of a block under construction.
    ///
    /// `None` if no writer has registered the block yet or it was sealed
    /// since the caller resolved it; either way the namespace is current.
    pub(crate) fn visible_length(&self, block: BlockId) -> Option<u64> {
        self.watermarks.get(&block).map(|w| w.get())
    }

    pub(crate) fn check_open(&self) -> CascadeResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CascadeError::Closed("cluster is shut down".into()))
        }
    }
}

/// Builder for `LocalCluster`
#[derive(Debug, Clone)]
pub struct LocalClusterBuilder {
    config: CascadeConfig,
    nodes: Option<usize>,
    dir: Option<PathBuf>,
}

impl LocalClusterBuilder {
    /// Cluster-wide configuration (default: `CascadeConfig::default()`)
    pub fn config(mut self, config: CascadeConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of replica nodes (default: the configured replication)
    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Store replicas under `dir` instead of a temporary directory
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Start the cluster.
    pub fn build(self) -> CascadeResult<LocalCluster> {
        self.config.validate()?;
        let node_count = self.nodes.unwrap_or(self.config.replication);
        if node_count < self.config.replication {
            return Err(CascadeError::InvalidConfig(format!(
                "{} nodes cannot hold {} replicas",
                node_count, self.config.replication
            )));
        }

        let (root, temp) = match self.dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                // The namespace is in memory, so replicas left by an earlier
                // run would collide with freshly allocated block ids.
                for i in 0..node_count {
                    let node_dir = dir.join(format!("node-{}", i));
                    if node_dir.is_dir() && std::fs::read_dir(&node_dir)?.next().is_some() {
                        return Err(CascadeError::InvalidConfig(format!(
                            "{} already holds replica storage",
                            node_dir.display()
                        )));
                    }
                }
                (dir, None)
            }
            None => {
                let temp = tempfile::Builder::new().prefix("cascade-").tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        let nodes: Vec<Arc<ReplicaNode>> = (0..node_count)
            .map(|i| ReplicaNode::new(NodeId(i as u32), root.join(format!("node-{}", i))))
            .collect::<CascadeResult<_>>()?;
        let namespace = Arc::new(LocalNamespace::new(
            nodes.iter().map(|n| n.location()).collect(),
        ));
        let context = Arc::new(ClusterContext {
            namespace: Arc::clone(&namespace) as Arc<dyn NamespaceService>,
            nodes: nodes.iter().map(|n| (n.id(), Arc::clone(n))).collect(),
            watermarks: DashMap::new(),
            open: AtomicBool::new(true),
        });

        info!(
            target: "cascade::cluster",
            root = %root.display(),
            nodes = node_count,
            replication = self.config.replication,
            block_size = self.config.block_size,
            bytes_per_checksum = self.config.bytes_per_checksum,
            "Local cluster started"
        );

        Ok(LocalCluster {
            config: self.config,
            context,
            namespace,
            nodes,
            root,
            _temp: temp,
        })
    }
}

/// In-process replicated file store
pub struct LocalCluster {
    config: CascadeConfig,
    context: Arc<ClusterContext>,
    namespace: Arc<LocalNamespace>,
    nodes: Vec<Arc<ReplicaNode>>,
    root: PathBuf,
    _temp: Option<TempDir>,
}

impl LocalCluster {
    /// Start configuring a cluster.
    pub fn builder() -> LocalClusterBuilder {
        LocalClusterBuilder {
            config: CascadeConfig::default(),
            nodes: None,
            dir: None,
        }
    }

    /// Start a cluster in `dir`, configured by `dir/cascade.toml`.
    ///
    /// A commented default config file is written on first use.
    pub fn open_dir(dir: impl AsRef<Path>) -> CascadeResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let config_path = dir.join(CONFIG_FILE_NAME);
        CascadeConfig::write_default_if_missing(&config_path)?;
        let config = CascadeConfig::from_file(&config_path)?;
        Self::builder().config(config).dir(dir).build()
    }

    /// Cluster-wide configuration
    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Directory holding node storage
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replica nodes, in id order
    pub fn nodes(&self) -> &[Arc<ReplicaNode>] {
        &self.nodes
    }

    /// Node `index`, for fault injection
    pub fn node(&self, index: usize) -> Option<&Arc<ReplicaNode>> {
        self.nodes.get(index)
    }

    /// The cluster's namespace
    pub fn namespace(&self) -> &LocalNamespace {
        &self.namespace
    }

    /// Create `path` and return its write session.
    pub fn create(&self, path: &str, options: CreateOptions) -> CascadeResult<FileWriteSession> {
        self.context.check_open()?;
        let config = options.apply(&self.config);
        config.validate()?;
        let file_id = self.namespace.create_file(
            path,
            config.block_size,
            config.replication,
            options.overwrite,
        )?;
        FileWriteSession::new(path.to_string(), file_id, config, Arc::clone(&self.context))
    }

    /// Open `path` for reading.
    pub fn open(&self, path: &str) -> CascadeResult<VisibleLengthReader> {
        self.context.check_open()?;
        self.namespace.get_file_status(path)?;
        Ok(VisibleLengthReader::new(
            path.to_string(),
            Arc::clone(&self.context),
        ))
    }

    /// Status of `path`.
    ///
    /// While the file is under construction the length covers sealed
    /// blocks plus the visible length of the block being written.
    pub fn file_status(&self, path: &str) -> CascadeResult<FileStatus> {
        let mut status = self.namespace.get_file_status(path)?;
        if !status.complete {
            let blocks = self.namespace.get_block_locations(path)?;
            if let Some(active) = blocks.last().filter(|b| !b.is_sealed()) {
                match self.context.visible_length(active.located.block.id) {
                    Some(visible) => status.length += visible,
                    // Sealed after the lookup above: the namespace now has it.
                    None => status = self.namespace.get_file_status(path)?,
                }
            }
        }
        Ok(status)
    }

    /// Visible length of a block under construction, or `None` if the
    /// block is sealed or no writer registered it
    pub fn visible_length(&self, block: BlockId) -> Option<u64> {
        self.context.visible_length(block)
    }

    /// Stop serving: sessions and readers fail with `Closed`, nodes go down.
    pub fn shutdown(&self) {
        if self.context.open.swap(false, Ordering::AcqRel) {
            for node in &self.nodes {
                node.shutdown();
            }
            info!(target: "cascade::cluster", root = %self.root.display(), "Local cluster shut down");
        }
    }

    /// Whether the cluster is serving
    pub fn is_running(&self) -> bool {
        self.context.open.load(Ordering::Acquire)
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cluster() -> LocalCluster {
        LocalCluster::builder()
            .config(CascadeConfig::for_testing())
            .nodes(3)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_too_few_nodes() {
        let err = LocalCluster::builder()
            .config(CascadeConfig::for_testing().with_replication(3))
            .nodes(2)
            .build()
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidConfig(_)));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = LocalCluster::builder()
            .config(CascadeConfig::for_testing().with_block_size(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidConfig(_)));
    }

    #[test]
    fn test_create_open_status() {
        let c = cluster();
        let mut out = c.create("/a", CreateOptions::new()).unwrap();
        out.write(b"abc").unwrap();
        assert_eq!(c.file_status("/a").unwrap().length, 0);
        out.hflush().unwrap();
        assert_eq!(c.file_status("/a").unwrap().length, 3);
        assert_eq!(c.open("/a").unwrap().read(0, 10).unwrap(), b"abc".to_vec());
        out.close().unwrap();
        let status = c.file_status("/a").unwrap();
        assert!(status.complete);
        assert_eq!(status.length, 3);
        assert_eq!(status.replication, 2);
    }

    #[test]
    fn test_create_options_override() {
        let c = cluster();
        let out = c
            .create("/b", CreateOptions::new().replication(3).block_size(1024))
            .unwrap();
        assert_eq!(out.config().replication, 3);
        assert_eq!(out.config().block_size, 1024);
        assert!(matches!(
            c.create("/b", CreateOptions::new()),
            Err(CascadeError::FileExists(_))
        ));
        assert!(c.create("/b", CreateOptions::new().overwrite(true)).is_ok());
    }

    #[test]
    fn test_open_missing_file() {
        let c = cluster();
        assert!(matches!(c.open("/nope"), Err(CascadeError::FileNotFound(_))));
    }

    #[test]
    fn test_shutdown_closes_sessions() {
        let c = cluster();
        let mut out = c.create("/a", CreateOptions::new()).unwrap();
        c.shutdown();
        assert!(!c.is_running());
        assert!(matches!(out.write(b"x"), Err(CascadeError::Closed(_))));
        assert!(matches!(
            c.create("/b", CreateOptions::new()),
            Err(CascadeError::Closed(_))
        ));
    }

    #[test]
    fn test_open_dir_writes_default_config() {
        let dir = TempDir::new().unwrap();
        let c = LocalCluster::open_dir(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(c.config(), &CascadeConfig::default());
        assert_eq!(c.nodes().len(), 3);
        assert!(c.root().join("node-0").is_dir());
    }

    #[test]
    fn test_sealed_blocks_release_watermarks() {
        let c = LocalCluster::builder()
            .config(CascadeConfig::for_testing().with_block_size(512))
            .build()
            .unwrap();
        let mut out = c.create("/many", CreateOptions::new()).unwrap();
        for i in 0..50u8 {
            out.write(&[i; 512]).unwrap();
            out.hflush().unwrap();
            assert!(c.context.watermarks.len() <= 1);
        }
        let active = out.active_block().map(|b| b.block().id).unwrap();
        assert_eq!(c.visible_length(active), Some(512));

        assert_eq!(out.close().unwrap(), 50 * 512);
        assert_eq!(out.sealed_blocks().len(), 50);
        assert!(c.context.watermarks.is_empty());
        assert_eq!(c.visible_length(active), None);

        let status = c.file_status("/many").unwrap();
        assert_eq!(status.length, 50 * 512);
        let reader = c.open("/many").unwrap();
        assert_eq!(reader.visible_length().unwrap(), 50 * 512);
        assert_eq!(reader.read(49 * 512, 512).unwrap(), vec![49u8; 512]);
    }

    #[test]
    fn test_build_refuses_used_storage() {
        let dir = TempDir::new().unwrap();
        {
            let c = LocalCluster::builder()
                .config(CascadeConfig::for_testing())
                .dir(dir.path())
                .build()
                .unwrap();
            let mut out = c.create("/a", CreateOptions::new()).unwrap();
            out.write(b"abc").unwrap();
            out.close().unwrap();
        }
        let err = LocalCluster::builder()
            .config(CascadeConfig::for_testing())
            .dir(dir.path())
            .build()
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidConfig(_)));
    }
}
