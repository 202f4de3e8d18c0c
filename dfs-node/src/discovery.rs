//! Node discovery through an external registry.
//!
//! File servers publish themselves to a [`Registry`] on startup and dial
//! every node it lists. Two minimal backends are provided: an in-process
//! [`MemoryRegistry`] and a TOML-backed [`FileRegistry`] that several local
//! processes can share.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dfs_net::LockedMap;
use dfs_protocol::Node;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors reported by a registry backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no nodes registered")]
    Empty,
    #[error("registry i/o failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid registry file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to encode registry file: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Directory of known file servers, keyed by [`Node::address`].
#[async_trait]
pub trait Registry: Send + Sync {
    /// Every registered node. Fails with [`RegistryError::Empty`] when none are.
    async fn list_nodes(&self) -> Result<Vec<Node>, RegistryError>;

    /// Insert or replace the node with the same address.
    async fn add_node(&self, node: &Node) -> Result<(), RegistryError>;

    /// Forget the node with the same address. Unknown addresses are ignored.
    async fn remove_node(&self, node: &Node) -> Result<(), RegistryError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), RegistryError>;
}

/// Registry held in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    nodes: LockedMap<String, Node>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with `nodes`.
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let registry = Self::new();
        for node in nodes {
            registry.nodes.set(node.address.clone(), node);
        }
        registry
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_nodes(&self) -> Result<Vec<Node>, RegistryError> {
        let mut nodes = self.nodes.values();
        if nodes.is_empty() {
            return Err(RegistryError::Empty);
        }
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(nodes)
    }

    async fn add_node(&self, node: &Node) -> Result<(), RegistryError> {
        self.nodes.set(node.address.clone(), node.clone());
        Ok(())
    }

    async fn remove_node(&self, node: &Node) -> Result<(), RegistryError> {
        self.nodes.delete(&node.address);
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

/// On-disk layout of a [`FileRegistry`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    nodes: Vec<Node>,
}

/// Registry persisted as a TOML file.
///
/// Every call re-reads the file, so separate processes pointed at the same
/// path see each other's updates. Calls within one process are serialized;
/// concurrent writers from different processes are not.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<RegistryFile, RegistryError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(source) => Err(RegistryError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn store(&self, file: &RegistryFile) -> Result<(), RegistryError> {
        let io_err = |source: io::Error| RegistryError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let contents = toml::to_string_pretty(file)?;
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, contents).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn list_nodes(&self) -> Result<Vec<Node>, RegistryError> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        if file.nodes.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(file.nodes)
    }

    async fn add_node(&self, node: &Node) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        match file.nodes.iter_mut().find(|n| n.address == node.address) {
            Some(existing) => *existing = node.clone(),
            None => file.nodes.push(node.clone()),
        }
        self.store(&file).await?;

        tracing::debug!(
            path = %self.path.display(),
            address = %node.address,
            "node registered"
        );
        Ok(())
    }

    async fn remove_node(&self, node: &Node) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let before = file.nodes.len();
        file.nodes.retain(|n| n.address != node.address);
        if file.nodes.len() == before {
            return Ok(());
        }
        self.store(&file).await?;

        tracing::debug!(
            path = %self.path.display(),
            address = %node.address,
            "node removed"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}
