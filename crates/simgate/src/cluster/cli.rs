//! `ClusterHandle` over the `rados` command-line tool.
//!
//! The gateway does not link librados; every capability is realized by
//! spawning the administrative CLI. Namespace enumeration uses the tool's
//! pool-wide listing written to a scratch file: one line per object, with a
//! leading tab-separated namespace field when the object lives in one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;

use bytes::Bytes;
use tokio::process::Command;

use super::{ClusterError, ClusterHandle, Result};

pub struct CliCluster {
    conf: PathBuf,
    pool: String,
    user: String,
}

impl CliCluster {
    pub fn new(conf: PathBuf, pool: String, user: String) -> Self {
        Self { conf, pool, user }
    }

    /// Verify that the cluster is reachable and the pool exists.
    /// The gateway aborts startup when this fails.
    pub async fn connect_check(&self) -> Result<()> {
        let out = self.run(&["lspools"], None).await?;
        let pools = String::from_utf8_lossy(&out);
        if pools.lines().any(|line| line.trim() == self.pool) {
            Ok(())
        } else {
            Err(ClusterError::Command(format!(
                "pool {} not present on cluster",
                self.pool
            )))
        }
    }

    /// Run `rados` with the standing connection flags plus `args`.
    async fn run(&self, args: &[&str], namespace: Option<&str>) -> Result<Vec<u8>> {
        let mut cmd = Command::new("rados");
        cmd.arg("-p")
            .arg(&self.pool)
            .arg("--user")
            .arg(&self.user)
            .arg("--keyring")
            .arg(&self.conf);
        if let Some(namespace) = namespace {
            cmd.arg("-N").arg(namespace);
        }
        cmd.args(args);
        cmd.stdin(Stdio::null());

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ClusterError::Command(format!(
                "rados {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn missing(&self, namespace: &str, key: &str, err: ClusterError) -> ClusterError {
        // The CLI reports missing objects through its exit status; surface
        // them as NotFound so callers can distinguish them from transport
        // failures.
        match err {
            ClusterError::Command(message) if message.contains("No such file or directory") => {
                ClusterError::NotFound {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                }
            }
            other => other,
        }
    }
}

#[async_trait::async_trait]
impl ClusterHandle for CliCluster {
    async fn list_objects(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, BTreeMap<String, Vec<u8>>)>> {
        let out = self.run(&["ls", "-"], Some(namespace)).await?;
        let listing = String::from_utf8_lossy(&out);

        let mut objects = Vec::new();
        for key in listing.lines().filter(|line| !line.is_empty()) {
            let xattrs = match self.get_xattrs(namespace, key).await {
                Ok(xattrs) => xattrs,
                Err(err) => {
                    // The object may have vanished between listing and stat.
                    tracing::warn!(target: "CORE", namespace, key, %err, "skipping object while listing");
                    continue;
                }
            };
            objects.push((key.to_string(), xattrs));
        }
        Ok(objects)
    }

    async fn stat(&self, namespace: &str, key: &str) -> Result<u64> {
        let out = self
            .run(&["stat", key], Some(namespace))
            .await
            .map_err(|err| self.missing(namespace, key, err))?;
        let text = String::from_utf8_lossy(&out);
        // `rados stat` prints `<pool>/<key> mtime <..>, size <n>`.
        text.split_whitespace()
            .last()
            .and_then(|size| size.parse().ok())
            .ok_or_else(|| ClusterError::Parse(format!("unrecognized stat output: {}", text.trim())))
    }

    async fn read(&self, namespace: &str, key: &str, _len: u64) -> Result<Bytes> {
        let out = self
            .run(&["get", key, "-"], Some(namespace))
            .await
            .map_err(|err| self.missing(namespace, key, err))?;
        Ok(Bytes::from(out))
    }

    async fn get_xattrs(&self, namespace: &str, key: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let out = self
            .run(&["listxattr", key], Some(namespace))
            .await
            .map_err(|err| self.missing(namespace, key, err))?;
        let names = String::from_utf8_lossy(&out);

        let mut xattrs = BTreeMap::new();
        for name in names.lines().filter(|line| !line.is_empty()) {
            let value = self
                .run(&["getxattr", key, name], Some(namespace))
                .await
                .map_err(|err| self.missing(namespace, key, err))?;
            xattrs.insert(name.to_string(), value);
        }
        Ok(xattrs)
    }

    async fn set_xattr(&self, namespace: &str, key: &str, name: &str, value: &[u8]) -> Result<()> {
        let value = std::str::from_utf8(value)
            .map_err(|_| ClusterError::Parse(format!("xattr {name} value is not UTF-8")))?;
        self.run(&["setxattr", key, name, value], Some(namespace))
            .await
            .map_err(|err| self.missing(namespace, key, err))?;
        Ok(())
    }

    async fn rm_xattr(&self, namespace: &str, key: &str, name: &str) -> Result<()> {
        self.run(&["rmxattr", key, name], Some(namespace))
            .await
            .map_err(|err| self.missing(namespace, key, err))?;
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<BTreeSet<String>> {
        let scratch = tempfile::NamedTempFile::new()?;
        let path = scratch.path().to_string_lossy().into_owned();
        self.run(&["ls", &path, "--all"], None).await?;

        let listing = tokio::fs::read_to_string(scratch.path()).await?;
        Ok(parse_namespace_listing(&listing))
    }
}

/// Parse the `--all` listing: two tab-separated fields when the object lives
/// in a namespace, one field otherwise. The namespaces are the distinct
/// non-empty first fields.
fn parse_namespace_listing(listing: &str) -> BTreeSet<String> {
    let mut namespaces = BTreeSet::new();
    for line in listing.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() == 2 && !fields[0].is_empty() {
            namespaces.insert(fields[0].to_string());
        }
    }
    namespaces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_listing_keeps_distinct_first_fields() {
        let listing = "ns1\tuniverse.fo.eo.nodes@1.0\n\
                       ns1\tuniverse.fo.eo.nodes@2.0\n\
                       ns2\tuniverse.fo.m.nodes@1.0\n\
                       universe.fo.orphan.nodes@1.0\n\
                       \tuniverse.fo.empty.nodes@1.0\n";
        let namespaces = parse_namespace_listing(listing);
        assert_eq!(
            namespaces.into_iter().collect::<Vec<_>>(),
            vec!["ns1".to_string(), "ns2".to_string()]
        );
    }

    #[test]
    fn empty_listing_has_no_namespaces() {
        assert!(parse_namespace_listing("").is_empty());
    }
}
