//! In-memory cluster used by the embedded self-test and the test suites.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{ClusterError, ClusterHandle, Result};

#[derive(Debug, Default)]
struct StoredObject {
    data: Bytes,
    xattrs: BTreeMap<String, Vec<u8>>,
}

/// A cluster backed by nested maps. Cloning shares the underlying pool.
#[derive(Debug, Default, Clone)]
pub struct MemoryCluster {
    namespaces: Arc<Mutex<BTreeMap<String, BTreeMap<String, StoredObject>>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, replacing any previous contents.
    pub fn put_object(&self, namespace: &str, key: &str, data: impl Into<Bytes>) {
        let mut namespaces = self.namespaces.lock().unwrap();
        let object = namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default();
        object.data = data.into();
    }

    /// Seed an extended attribute on an existing or new object.
    pub fn put_xattr(&self, namespace: &str, key: &str, name: &str, value: impl Into<Vec<u8>>) {
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .xattrs
            .insert(name.to_string(), value.into());
    }

    /// Read back an xattr, for assertions on persisted hashes.
    pub fn xattr(&self, namespace: &str, key: &str, name: &str) -> Option<Vec<u8>> {
        let namespaces = self.namespaces.lock().unwrap();
        namespaces
            .get(namespace)?
            .get(key)?
            .xattrs
            .get(name)
            .cloned()
    }

    fn with_object<T>(
        &self,
        namespace: &str,
        key: &str,
        f: impl FnOnce(&mut StoredObject) -> T,
    ) -> Result<T> {
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces
            .get_mut(namespace)
            .and_then(|objects| objects.get_mut(key))
            .map(f)
            .ok_or_else(|| ClusterError::NotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl ClusterHandle for MemoryCluster {
    async fn list_objects(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, BTreeMap<String, Vec<u8>>)>> {
        let namespaces = self.namespaces.lock().unwrap();
        Ok(namespaces
            .get(namespace)
            .map(|objects| {
                objects
                    .iter()
                    .map(|(key, object)| (key.clone(), object.xattrs.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stat(&self, namespace: &str, key: &str) -> Result<u64> {
        self.with_object(namespace, key, |object| object.data.len() as u64)
    }

    async fn read(&self, namespace: &str, key: &str, len: u64) -> Result<Bytes> {
        self.with_object(namespace, key, |object| {
            let len = (len as usize).min(object.data.len());
            object.data.slice(..len)
        })
    }

    async fn get_xattrs(&self, namespace: &str, key: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        self.with_object(namespace, key, |object| object.xattrs.clone())
    }

    async fn set_xattr(&self, namespace: &str, key: &str, name: &str, value: &[u8]) -> Result<()> {
        self.with_object(namespace, key, |object| {
            object.xattrs.insert(name.to_string(), value.to_vec());
        })
    }

    async fn rm_xattr(&self, namespace: &str, key: &str, name: &str) -> Result<()> {
        self.with_object(namespace, key, |object| {
            object.xattrs.remove(name);
        })
    }

    async fn list_namespaces(&self) -> Result<BTreeSet<String>> {
        let namespaces = self.namespaces.lock().unwrap();
        Ok(namespaces.keys().cloned().collect())
    }
}
