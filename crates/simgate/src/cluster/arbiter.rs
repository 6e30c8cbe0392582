//! Fans storage tasks across a pool of cluster connections.
//!
//! Every pool worker owns one [`ClusterHandle`] and a priority pattern: an
//! ordered list of task queues with a blocking budget on the first slot.
//! A worker parks briefly on its primary queue, then peeks at its fallback
//! queues without blocking. Serving a fallback item makes the worker skip the
//! next primary park so a deep fallback queue keeps draining quickly. This
//! gives type-level fairness without a shared priority queue: interactive
//! object reads are never stuck behind a full-index sweep.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{decode_tags, ClusterHandle, Result, TagMap, SHA1SUM_XATTR};
use crate::index::NewFile;

/// How long a worker parks on its primary queue before checking fallbacks.
const PRIMARY_PARK: Duration = Duration::from_millis(100);
/// Ceiling on waiting for one namespace of a sweep to report back.
const NAMESPACE_REPORT_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a pool worker can be asked to do.
#[derive(Debug)]
pub enum ClusterTask {
    /// Fetch attributes and raw bytes of a single object (user-interactive).
    ReadObjectData {
        namespace: String,
        key: String,
        reply: oneshot::Sender<ObjectData>,
    },
    /// Fetch or compute-and-persist an object's SHA-1. The answer lands on
    /// the arbiter-wide hash answer channel.
    ReadObjectHash { namespace: String, key: String },
    /// Fetch only the extended attributes.
    ReadObjectTags {
        namespace: String,
        key: String,
        reply: oneshot::Sender<ObjectTags>,
    },
    /// List one namespace with attributes; reports on the namespace-index
    /// return channel consumed by the `ReadIndex` orchestrator.
    ReadNamespaceIndex { namespace: String },
    /// Enumerate namespaces, fan out `ReadNamespaceIndex` tasks, and emit
    /// the assembled result.
    ReadIndex,
}

#[derive(Debug)]
pub struct ObjectData {
    pub namespace: String,
    pub object: String,
    pub contents: Bytes,
    pub tags: TagMap,
}

#[derive(Debug)]
pub struct ObjectTags {
    pub namespace: String,
    pub object: String,
    pub tags: TagMap,
}

/// One namespace worth of a sweep.
#[derive(Debug)]
pub struct NamespaceIndex {
    pub namespace: String,
    pub objects: Vec<(String, TagMap)>,
}

/// The assembled result of a full sweep.
#[derive(Debug)]
pub struct IndexResult {
    pub namespaces: Vec<NamespaceIndex>,
}

/// The five per-kind task queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Data,
    Hashes,
    Tags,
    IndexNamespaces,
    Index,
}

/// How the pool is partitioned across priority patterns.
#[derive(Debug, Clone)]
pub struct PoolPlan {
    pub data: usize,
    pub hashes: usize,
    pub tags: usize,
    pub index_namespaces: usize,
    pub index: usize,
}

impl Default for PoolPlan {
    fn default() -> Self {
        Self {
            data: 4,
            hashes: 6,
            tags: 0,
            index_namespaces: 8,
            index: 1,
        }
    }
}

impl PoolPlan {
    pub fn total(&self) -> usize {
        self.data + self.hashes + self.tags + self.index_namespaces + self.index
    }

    fn patterns(&self) -> Vec<Vec<QueueKind>> {
        use QueueKind::*;
        let mut patterns = Vec::with_capacity(self.total());
        patterns.extend(std::iter::repeat(vec![Data, Hashes, Tags]).take(self.data));
        patterns.extend(std::iter::repeat(vec![Hashes, Tags, Data]).take(self.hashes));
        patterns.extend(std::iter::repeat(vec![Tags, Hashes, Data]).take(self.tags));
        patterns.extend(
            std::iter::repeat(vec![IndexNamespaces, Hashes, Tags, Data])
                .take(self.index_namespaces),
        );
        patterns.extend(std::iter::repeat(vec![Index, Hashes, Data]).take(self.index));
        patterns
    }
}

/// Senders for enqueueing tasks, handed to the other components.
#[derive(Clone)]
pub struct ArbiterHandles {
    data: mpsc::Sender<ClusterTask>,
    hashes: mpsc::Sender<ClusterTask>,
    tags: mpsc::Sender<ClusterTask>,
    index: mpsc::Sender<ClusterTask>,
}

impl ArbiterHandles {
    pub async fn read_object_data(&self, namespace: String, key: String) -> oneshot::Receiver<ObjectData> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .data
            .send(ClusterTask::ReadObjectData { namespace, key, reply })
            .await;
        rx
    }

    pub async fn read_object_hash(&self, namespace: String, key: String) {
        let _ = self
            .hashes
            .send(ClusterTask::ReadObjectHash { namespace, key })
            .await;
    }

    pub async fn read_object_tags(&self, namespace: String, key: String) -> oneshot::Receiver<ObjectTags> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tags
            .send(ClusterTask::ReadObjectTags { namespace, key, reply })
            .await;
        rx
    }

    pub async fn read_index(&self) {
        let _ = self.index.send(ClusterTask::ReadIndex).await;
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<ClusterTask>>>;

struct Queue {
    tx: mpsc::Sender<ClusterTask>,
    rx: SharedReceiver,
}

impl Queue {
    fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

struct Queues {
    data: Queue,
    hashes: Queue,
    tags: Queue,
    index_namespaces: Queue,
    index: Queue,
    /// Return channel for `ReadNamespaceIndex`, consumed by the orchestrator.
    namespace_reports: Arc<Mutex<mpsc::Receiver<NamespaceIndex>>>,
    namespace_reports_tx: mpsc::Sender<NamespaceIndex>,
}

impl Queues {
    fn shared(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Data => &self.data,
            QueueKind::Hashes => &self.hashes,
            QueueKind::Tags => &self.tags,
            QueueKind::IndexNamespaces => &self.index_namespaces,
            QueueKind::Index => &self.index,
        }
    }
}

/// The arbiter: builds the queues, spawns the pool, and hands out senders.
pub struct Arbiter {
    workers: Vec<tokio::task::JoinHandle<()>>,
    handles: ArbiterHandles,
}

impl Arbiter {
    /// Spawn the worker pool. Each pool slot connects through a clone of the
    /// same shared handle; `hash_answers` receives `ReadObjectHash` results
    /// and `index_results` receives assembled sweeps.
    pub fn spawn(
        cluster: Arc<dyn ClusterHandle>,
        plan: PoolPlan,
        hash_answers: mpsc::Sender<NewFile>,
        index_results: mpsc::Sender<IndexResult>,
        shutdown: CancellationToken,
    ) -> Self {
        assert!(plan.total() >= 2, "need at least two cluster connections");

        let (namespace_reports_tx, namespace_reports_rx) = mpsc::channel(1024);
        let queues = Arc::new(Queues {
            data: Queue::new(1024),
            hashes: Queue::new(1024),
            tags: Queue::new(1024),
            index_namespaces: Queue::new(1024),
            index: Queue::new(64),
            namespace_reports: Arc::new(Mutex::new(namespace_reports_rx)),
            namespace_reports_tx,
        });

        let handles = ArbiterHandles {
            data: queues.data.tx.clone(),
            hashes: queues.hashes.tx.clone(),
            tags: queues.tags.tx.clone(),
            index: queues.index.tx.clone(),
        };

        let mut workers = Vec::new();
        for (id, pattern) in plan.patterns().into_iter().enumerate() {
            let worker = Worker {
                id,
                cluster: cluster.clone(),
                queues: queues.clone(),
                pattern,
                hash_answers: hash_answers.clone(),
                index_results: index_results.clone(),
                shutdown: shutdown.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        Self { workers, handles }
    }

    pub fn handles(&self) -> ArbiterHandles {
        self.handles.clone()
    }

    /// Wait for all pool workers to exit after the shutdown signal.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

struct Worker {
    id: usize,
    cluster: Arc<dyn ClusterHandle>,
    queues: Arc<Queues>,
    pattern: Vec<QueueKind>,
    hash_answers: mpsc::Sender<NewFile>,
    index_results: mpsc::Sender<IndexResult>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(target: "CORE", id = self.id, pattern = ?self.pattern, "cluster worker up");

        // Set after serving a fallback queue: skip the next primary park so
        // the fallback keeps draining at full speed.
        let mut skip_primary_park = false;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let mut picked = None;
            for (slot, kind) in self.pattern.iter().enumerate() {
                let queue = self.queues.shared(*kind);
                let task = if slot == 0 && !skip_primary_park {
                    let mut rx = queue.rx.lock().await;
                    tokio::select! {
                        task = rx.recv() => task,
                        _ = tokio::time::sleep(PRIMARY_PARK) => None,
                        _ = self.shutdown.cancelled() => None,
                    }
                } else {
                    // Peek without blocking; a sibling already draining this
                    // queue counts as the queue being served.
                    match queue.rx.try_lock() {
                        Ok(mut rx) => rx.try_recv().ok(),
                        Err(_) => None,
                    }
                };

                if let Some(task) = task {
                    skip_primary_park = slot > 0;
                    picked = Some(task);
                    break;
                }
            }

            match picked {
                Some(task) => self.execute(task).await,
                None => skip_primary_park = false,
            }
        }

        tracing::debug!(target: "CORE", id = self.id, "cluster worker down");
    }

    async fn execute(&self, task: ClusterTask) {
        match task {
            ClusterTask::ReadObjectData { namespace, key, reply } => {
                match self.read_object_data(&namespace, &key).await {
                    Ok(data) => {
                        // The requester may have hung up; its loss.
                        let _ = reply.send(data);
                    }
                    Err(err) => {
                        tracing::warn!(target: "CORE", namespace, key, %err, "object read failed");
                    }
                }
            }
            ClusterTask::ReadObjectHash { namespace, key } => {
                let sha1sum = match self.object_hash(&namespace, &key).await {
                    Ok(sha1sum) => sha1sum,
                    Err(err) => {
                        tracing::warn!(target: "CORE", namespace, key, %err, "hash lookup failed");
                        // Answer with an empty hash so the record still
                        // reaches the index.
                        String::new()
                    }
                };
                let _ = self
                    .hash_answers
                    .send(NewFile { namespace, key, sha1sum })
                    .await;
            }
            ClusterTask::ReadObjectTags { namespace, key, reply } => {
                match self.object_tags(&namespace, &key).await {
                    Ok(tags) => {
                        let _ = reply.send(ObjectTags {
                            namespace,
                            object: key,
                            tags,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(target: "CORE", namespace, key, %err, "tag read failed");
                    }
                }
            }
            ClusterTask::ReadNamespaceIndex { namespace } => {
                let objects = match self.namespace_index(&namespace).await {
                    Ok(objects) => objects,
                    Err(err) => {
                        tracing::warn!(target: "CORE", namespace, %err, "namespace listing failed");
                        Vec::new()
                    }
                };
                let _ = self
                    .queues
                    .namespace_reports_tx
                    .send(NamespaceIndex { namespace, objects })
                    .await;
            }
            ClusterTask::ReadIndex => self.orchestrate_index().await,
        }
    }

    /// Attributes with a guaranteed `sha1sum` tag, computing and persisting
    /// the hash when it is missing or empty.
    async fn object_tags(&self, namespace: &str, key: &str) -> Result<TagMap> {
        let mut tags = decode_tags(self.cluster.get_xattrs(namespace, key).await?);

        if tags.get(SHA1SUM_XATTR).map_or(true, |hash| hash.is_empty()) {
            let sha1sum = self.compute_and_persist_hash(namespace, key).await?;
            tags.insert(SHA1SUM_XATTR.to_string(), sha1sum);
        }
        Ok(tags)
    }

    async fn object_hash(&self, namespace: &str, key: &str) -> Result<String> {
        let tags = self.object_tags(namespace, key).await?;
        Ok(tags.get(SHA1SUM_XATTR).cloned().unwrap_or_default())
    }

    async fn compute_and_persist_hash(&self, namespace: &str, key: &str) -> Result<String> {
        tracing::debug!(target: "CORE", namespace, key, "computing content hash");

        let size = self.cluster.stat(namespace, key).await?;
        let contents = self.cluster.read(namespace, key, size).await?;
        let sha1sum = hex::encode(Sha1::digest(&contents));

        // Persisting the hash is best effort: the caller still gets it.
        if let Err(err) = self
            .cluster
            .set_xattr(namespace, key, SHA1SUM_XATTR, sha1sum.as_bytes())
            .await
        {
            tracing::warn!(target: "CORE", namespace, key, %err, "failed to persist content hash");
        }
        Ok(sha1sum)
    }

    async fn read_object_data(&self, namespace: &str, key: &str) -> Result<ObjectData> {
        let size = self.cluster.stat(namespace, key).await?;
        let contents = self.cluster.read(namespace, key, size).await?;
        let tags = self.object_tags(namespace, key).await?;
        Ok(ObjectData {
            namespace: namespace.to_string(),
            object: key.to_string(),
            contents,
            tags,
        })
    }

    async fn namespace_index(&self, namespace: &str) -> Result<Vec<(String, TagMap)>> {
        tracing::debug!(target: "CORE", namespace, "listing namespace");
        let objects = self.cluster.list_objects(namespace).await?;
        Ok(objects
            .into_iter()
            .map(|(key, xattrs)| (key, decode_tags(xattrs)))
            .collect())
    }

    /// The single `index` worker: enumerate namespaces, fan one listing task
    /// out per namespace, collect the reports, emit the assembled result,
    /// then drop any `ReadIndex` requests that piled up during the sweep.
    async fn orchestrate_index(&self) {
        let namespaces = match self.cluster.list_namespaces().await {
            Ok(namespaces) => namespaces,
            Err(err) => {
                tracing::warn!(target: "CORE", %err, "namespace enumeration failed");
                let _ = self
                    .index_results
                    .send(IndexResult { namespaces: Vec::new() })
                    .await;
                return;
            }
        };
        tracing::info!(target: "CORE", count = namespaces.len(), "index sweep started");

        let mut expected: BTreeSet<String> = namespaces.iter().cloned().collect();

        // Enqueue from a helper task so collection below runs concurrently;
        // with more namespaces than queue slots a sequential enqueue would
        // fill both the task queue and the report channel and wedge the sweep.
        let listing_queue = self.queues.index_namespaces.tx.clone();
        let enqueue = tokio::spawn(async move {
            for namespace in namespaces {
                if listing_queue
                    .send(ClusterTask::ReadNamespaceIndex { namespace })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut collected = Vec::new();
        {
            let mut reports = self.queues.namespace_reports.lock().await;
            while !expected.is_empty() {
                match timeout(NAMESPACE_REPORT_TIMEOUT, reports.recv()).await {
                    Ok(Some(report)) => {
                        expected.remove(&report.namespace);
                        collected.push(report);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(
                            target: "CORE",
                            missing = expected.len(),
                            "index sweep gave up waiting for namespace reports"
                        );
                        break;
                    }
                }
            }
        }

        let _ = enqueue.await;
        tracing::info!(target: "CORE", namespaces = collected.len(), "index sweep finished");
        let _ = self
            .index_results
            .send(IndexResult { namespaces: collected })
            .await;

        // A sweep that just finished answers every request queued while it
        // ran; starting another immediately would rescan for nothing.
        if let Ok(mut stale) = self.queues.index.rx.try_lock() {
            while stale.try_recv().is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;

    fn sha1_hex(data: &[u8]) -> String {
        hex::encode(Sha1::digest(data))
    }

    fn spawn_pool(
        cluster: MemoryCluster,
        plan: PoolPlan,
    ) -> (
        Arbiter,
        mpsc::Receiver<NewFile>,
        mpsc::Receiver<IndexResult>,
        CancellationToken,
    ) {
        let (hash_tx, hash_rx) = mpsc::channel(64);
        let (index_tx, index_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let arbiter = Arbiter::spawn(
            Arc::new(cluster),
            plan,
            hash_tx,
            index_tx,
            shutdown.clone(),
        );
        (arbiter, hash_rx, index_rx, shutdown)
    }

    #[tokio::test]
    async fn hash_on_read_computes_and_persists() {
        let cluster = MemoryCluster::new();
        cluster.put_object("ns", "universe.fo.eo.nodes@1.0", &b"payload"[..]);

        let (arbiter, mut hash_rx, _index_rx, shutdown) =
            spawn_pool(cluster.clone(), PoolPlan::default());
        let handles = arbiter.handles();

        handles
            .read_object_hash("ns".to_string(), "universe.fo.eo.nodes@1.0".to_string())
            .await;

        let answer = hash_rx.recv().await.unwrap();
        assert_eq!(answer.sha1sum, sha1_hex(b"payload"));
        assert_eq!(
            cluster.xattr("ns", "universe.fo.eo.nodes@1.0", SHA1SUM_XATTR),
            Some(sha1_hex(b"payload").into_bytes())
        );

        shutdown.cancel();
        arbiter.join().await;
    }

    #[tokio::test]
    async fn existing_hash_is_reused_not_recomputed() {
        let cluster = MemoryCluster::new();
        cluster.put_object("ns", "obj/universe.fo.eo.nodes@1.0", &b"data"[..]);
        cluster.put_xattr("ns", "obj/universe.fo.eo.nodes@1.0", SHA1SUM_XATTR, "feedface");

        let (arbiter, mut hash_rx, _index_rx, shutdown) =
            spawn_pool(cluster, PoolPlan::default());
        arbiter
            .handles()
            .read_object_hash("ns".to_string(), "obj/universe.fo.eo.nodes@1.0".to_string())
            .await;

        assert_eq!(hash_rx.recv().await.unwrap().sha1sum, "feedface");
        shutdown.cancel();
        arbiter.join().await;
    }

    #[tokio::test]
    async fn missing_object_answers_with_empty_hash() {
        let (arbiter, mut hash_rx, _index_rx, shutdown) =
            spawn_pool(MemoryCluster::new(), PoolPlan::default());
        arbiter
            .handles()
            .read_object_hash("ns".to_string(), "gone".to_string())
            .await;

        assert_eq!(hash_rx.recv().await.unwrap().sha1sum, "");
        shutdown.cancel();
        arbiter.join().await;
    }

    #[tokio::test]
    async fn object_data_carries_contents_and_tags() {
        let cluster = MemoryCluster::new();
        cluster.put_object("ns", "universe.fo.m.nodes@1.0", &b"mesh bytes"[..]);
        cluster.put_xattr("ns", "universe.fo.m.nodes@1.0", "creator", "solver");

        let (arbiter, _hash_rx, _index_rx, shutdown) =
            spawn_pool(cluster, PoolPlan::default());
        let reply = arbiter
            .handles()
            .read_object_data("ns".to_string(), "universe.fo.m.nodes@1.0".to_string())
            .await;

        let data = reply.await.unwrap();
        assert_eq!(&data.contents[..], b"mesh bytes");
        assert_eq!(data.tags.get("creator").unwrap(), "solver");
        assert_eq!(data.tags.get(SHA1SUM_XATTR).unwrap(), &sha1_hex(b"mesh bytes"));

        shutdown.cancel();
        arbiter.join().await;
    }

    #[tokio::test]
    async fn tags_pattern_worker_serves_tag_reads() {
        let cluster = MemoryCluster::new();
        cluster.put_object("ns", "universe.fo.m.nodes@1.0", &b"x"[..]);

        let plan = PoolPlan {
            data: 1,
            hashes: 0,
            tags: 1,
            index_namespaces: 0,
            index: 0,
        };
        let (arbiter, _hash_rx, _index_rx, shutdown) = spawn_pool(cluster, plan);
        let reply = arbiter
            .handles()
            .read_object_tags("ns".to_string(), "universe.fo.m.nodes@1.0".to_string())
            .await;

        let tags = reply.await.unwrap();
        assert_eq!(tags.tags.get(SHA1SUM_XATTR).unwrap(), &sha1_hex(b"x"));

        shutdown.cancel();
        arbiter.join().await;
    }

    #[tokio::test]
    async fn read_index_assembles_all_namespaces() {
        let cluster = MemoryCluster::new();
        cluster.put_object("ns1", "universe.fo.eo.nodes@1.0", &b"a"[..]);
        cluster.put_xattr("ns1", "universe.fo.eo.nodes@1.0", SHA1SUM_XATTR, "aa");
        cluster.put_object("ns2", "universe.fo.m.nodes@1.0", &b"b"[..]);

        let (arbiter, _hash_rx, mut index_rx, shutdown) =
            spawn_pool(cluster, PoolPlan::default());
        arbiter.handles().read_index().await;

        let result = index_rx.recv().await.unwrap();
        assert_eq!(result.namespaces.len(), 2);
        let mut names: Vec<_> = result
            .namespaces
            .iter()
            .map(|n| n.namespace.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["ns1", "ns2"]);

        shutdown.cancel();
        arbiter.join().await;
    }
}
