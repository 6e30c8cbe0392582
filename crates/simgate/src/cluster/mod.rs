//! The object-storage cluster boundary.
//!
//! The gateway never links the storage client library directly. Everything it
//! needs from the cluster is expressed as the [`ClusterHandle`] capability
//! set, with one implementation driving the `rados` command-line tool and an
//! in-memory implementation for tests.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

mod arbiter;
mod cli;
mod memory;

pub use arbiter::{
    Arbiter, ArbiterHandles, ClusterTask, IndexResult, NamespaceIndex, ObjectData, ObjectTags,
    PoolPlan,
};
pub use cli::CliCluster;
pub use memory::MemoryCluster;

/// Extended-attribute name under which an object's content hash is persisted.
pub const SHA1SUM_XATTR: &str = "sha1sum";

/// Decoded extended attributes of one object.
pub type TagMap = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("object {namespace}/{key} not found")]
    NotFound { namespace: String, key: String },
    #[error("cluster command failed: {0}")]
    Command(String),
    #[error("malformed cluster output: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Capabilities the gateway consumes from the storage cluster.
///
/// Namespaces are passed per call rather than set on a shared cursor, so a
/// handle can be owned by exactly one pool worker without coordination.
#[async_trait::async_trait]
pub trait ClusterHandle: Send + Sync {
    /// List all objects in `namespace` together with their raw extended
    /// attributes.
    async fn list_objects(&self, namespace: &str) -> Result<Vec<(String, BTreeMap<String, Vec<u8>>)>>;

    /// Size of an object in bytes.
    async fn stat(&self, namespace: &str, key: &str) -> Result<u64>;

    /// Read `len` bytes of an object, from the start.
    async fn read(&self, namespace: &str, key: &str, len: u64) -> Result<Bytes>;

    async fn get_xattrs(&self, namespace: &str, key: &str) -> Result<BTreeMap<String, Vec<u8>>>;

    async fn set_xattr(&self, namespace: &str, key: &str, name: &str, value: &[u8]) -> Result<()>;

    async fn rm_xattr(&self, namespace: &str, key: &str, name: &str) -> Result<()>;

    /// Enumerate the distinct namespaces of the pool.
    async fn list_namespaces(&self) -> Result<BTreeSet<String>>;
}

/// Decode raw xattr bytes into string tags, replacing invalid UTF-8.
pub(crate) fn decode_tags(raw: BTreeMap<String, Vec<u8>>) -> TagMap {
    raw.into_iter()
        .map(|(name, value)| (name, String::from_utf8_lossy(&value).into_owned()))
        .collect()
}
