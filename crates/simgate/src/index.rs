//! The authoritative in-memory index of known artifacts.
//!
//! The tree is owned by a single [`IndexStore`] task; every other component
//! talks to it over channels. Consumers always receive deep copies, never a
//! reference into live state.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cluster::ArbiterHandles;
use crate::keys::parse_object_key;

/// A new-file record as it travels between components: announced by the
/// simulation, answered by the cluster, pushed to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub namespace: String,
    pub key: String,
    pub sha1sum: String,
}

/// One node of the index tree. Interior levels are string-keyed branches;
/// leaves carry the full object key and its content hash. The untagged
/// serde shape makes the tree read and write as plain nested JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Leaf { object_key: String, sha1sum: String },
    Branch(BTreeMap<String, Node>),
}

impl Node {
    fn branch() -> Node {
        Node::Branch(BTreeMap::new())
    }
}

/// A deep copy of (part of) the tree, keyed by namespace.
pub type IndexSnapshot = BTreeMap<String, Node>;

/// What happened to an `add` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// Already admitted; the non-empty incoming hash replaced the leaf's.
    Updated,
    /// Already admitted and the incoming hash was empty.
    Unchanged,
    /// The key does not match the grammar; tree and admitted set untouched.
    Unparseable,
}

/// The tree plus the admitted-coordinate set that gates insertion.
#[derive(Debug, Default)]
pub struct Index {
    tree: BTreeMap<String, Node>,
    admitted: HashSet<String>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    fn coordinate(namespace: &str, key: &str) -> String {
        format!("{namespace}\t{key}")
    }

    pub fn is_admitted(&self, namespace: &str, key: &str) -> bool {
        self.admitted.contains(&Self::coordinate(namespace, key))
    }

    /// Admission policy for one record. Re-insertion is idempotent; a
    /// non-empty hash always wins the leaf's `sha1sum`, an empty one never
    /// overwrites an existing value.
    pub fn add(&mut self, namespace: &str, key: &str, sha1sum: &str) -> AddOutcome {
        if self.is_admitted(namespace, key) {
            if sha1sum.is_empty() {
                return AddOutcome::Unchanged;
            }
            if let Some(Node::Leaf { sha1sum: existing, .. }) = self.walk_mut(namespace, key) {
                *existing = sha1sum.to_string();
            }
            return AddOutcome::Updated;
        }

        let Some(decoded) = parse_object_key(key) else {
            tracing::debug!(target: "CORE", namespace, key, "cannot add file, key does not parse");
            return AddOutcome::Unparseable;
        };

        let mut node = self
            .tree
            .entry(namespace.to_string())
            .or_insert_with(Node::branch);
        node = Self::descend(node, &decoded.timestep);
        for level in decoded.tree_levels() {
            node = Self::descend(node, level);
        }
        *node = Node::Leaf {
            object_key: key.to_string(),
            sha1sum: sha1sum.to_string(),
        };

        self.admitted.insert(Self::coordinate(namespace, key));
        AddOutcome::Inserted
    }

    /// Step into `level`, creating it as a branch when absent. A leaf sitting
    /// where a branch is needed loses to the newer insert.
    fn descend<'t>(node: &'t mut Node, level: &str) -> &'t mut Node {
        if let Node::Leaf { object_key, .. } = node {
            tracing::debug!(target: "CORE", displaced = %object_key, "leaf displaced by deeper index path");
            *node = Node::branch();
        }
        match node {
            Node::Branch(children) => children
                .entry(level.to_string())
                .or_insert_with(Node::branch),
            Node::Leaf { .. } => unreachable!("leaf was just replaced by a branch"),
        }
    }

    /// Follow an admitted key's path to its node, if the tree still has it.
    fn walk_mut(&mut self, namespace: &str, key: &str) -> Option<&mut Node> {
        let decoded = parse_object_key(key)?;
        let mut node = self.tree.get_mut(namespace)?;
        node = match node {
            Node::Branch(children) => children.get_mut(&decoded.timestep)?,
            Node::Leaf { .. } => return None,
        };
        for level in decoded.tree_levels() {
            node = match node {
                Node::Branch(children) => children.get_mut(level)?,
                Node::Leaf { .. } => return None,
            };
        }
        Some(node)
    }

    /// An independent deep copy, optionally restricted to one namespace.
    /// An unknown namespace yields an empty snapshot.
    pub fn snapshot(&self, namespace: Option<&str>) -> IndexSnapshot {
        match namespace {
            Some(namespace) => self
                .tree
                .get(namespace)
                .map(|node| {
                    let mut filtered = BTreeMap::new();
                    filtered.insert(namespace.to_string(), node.clone());
                    filtered
                })
                .unwrap_or_default(),
            None => self.tree.clone(),
        }
    }
}

/// A request for an index snapshot; the reply channel receives a deep copy.
#[derive(Debug)]
pub struct IndexRequest {
    pub namespace: Option<String>,
    pub reply: oneshot::Sender<IndexSnapshot>,
}

/// Channel plumbing into the store, built by [`IndexStore::channels`].
pub struct StoreChannels {
    pub ingest: mpsc::Sender<NewFile>,
    pub refresher: mpsc::Sender<NewFile>,
    pub requests: mpsc::Sender<IndexRequest>,
    pub hash_answers: mpsc::Sender<NewFile>,
}

/// Single-threaded owner of the [`Index`].
///
/// Drives four inbound channels plus the periodic sweep trigger:
/// - ingest announcements (empty hashes detour through the arbiter's hash
///   lookup; the answer arrives on a dedicated channel),
/// - refresher records, drained in batches during sweeps,
/// - snapshot requests from the backend,
/// - the sweep ticker, which signals the refresher.
pub struct IndexStore {
    index: Index,
    ingest_rx: mpsc::Receiver<NewFile>,
    refresher_rx: mpsc::Receiver<NewFile>,
    request_rx: mpsc::Receiver<IndexRequest>,
    hash_answer_rx: mpsc::Receiver<NewFile>,
    push: mpsc::Sender<NewFile>,
    sweep: mpsc::Sender<()>,
    sweep_warmup: Duration,
    sweep_interval: Duration,
}

impl IndexStore {
    pub fn new(
        push: mpsc::Sender<NewFile>,
        sweep: mpsc::Sender<()>,
        sweep_warmup: Duration,
        sweep_interval: Duration,
    ) -> (Self, StoreChannels) {
        let (ingest_tx, ingest_rx) = mpsc::channel(1024);
        let (refresher_tx, refresher_rx) = mpsc::channel(4096);
        let (request_tx, request_rx) = mpsc::channel(64);
        let (hash_answer_tx, hash_answer_rx) = mpsc::channel(1024);

        let store = Self {
            index: Index::new(),
            ingest_rx,
            refresher_rx,
            request_rx,
            hash_answer_rx,
            push,
            sweep,
            sweep_warmup,
            sweep_interval,
        };
        let channels = StoreChannels {
            ingest: ingest_tx,
            refresher: refresher_tx,
            requests: request_tx,
            hash_answers: hash_answer_tx,
        };
        (store, channels)
    }

    pub async fn run(mut self, arbiter: ArbiterHandles, shutdown: CancellationToken) {
        tracing::info!(target: "CORE", "index store up");

        let mut sweep_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.sweep_warmup,
            self.sweep_interval,
        );
        let mut batch = Vec::with_capacity(256);
        let mut refresher_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(record) = self.ingest_rx.recv() => {
                    self.on_announcement(&arbiter, record).await;
                }
                Some(record) = self.hash_answer_rx.recv() => {
                    self.insert_and_push(record).await;
                }
                count = self.refresher_rx.recv_many(&mut batch, 256), if refresher_open => {
                    if count == 0 {
                        // Channel closed; nothing more will come.
                        refresher_open = false;
                        continue;
                    }
                    for record in batch.drain(..) {
                        self.index.add(&record.namespace, &record.key, &record.sha1sum);
                    }
                }
                Some(request) = self.request_rx.recv() => {
                    tracing::debug!(target: "CORE", namespace = ?request.namespace, "serving index snapshot");
                    let snapshot = self.index.snapshot(request.namespace.as_deref());
                    let _ = request.reply.send(snapshot);
                }
                _ = sweep_ticker.tick() => {
                    tracing::debug!(target: "CORE", "triggering index sweep");
                    let _ = self.sweep.try_send(());
                }
            }
        }

        tracing::info!(target: "CORE", "index store down");
    }

    /// An announcement from the simulation. Records without a hash detour
    /// through the cluster before they are inserted.
    async fn on_announcement(&mut self, arbiter: &ArbiterHandles, record: NewFile) {
        if record.sha1sum.is_empty() {
            tracing::debug!(
                target: "CORE",
                namespace = %record.namespace,
                key = %record.key,
                "announcement without hash, asking cluster"
            );
            arbiter.read_object_hash(record.namespace, record.key).await;
            return;
        }
        self.insert_and_push(record).await;
    }

    async fn insert_and_push(&mut self, record: NewFile) {
        let outcome = self
            .index
            .add(&record.namespace, &record.key, &record.sha1sum);
        tracing::debug!(
            target: "CORE",
            namespace = %record.namespace,
            key = %record.key,
            ?outcome,
            "absorbed announcement"
        );
        // Connected backends learn of the object either way; with no
        // listener attached the push channel is drained and discarded.
        let _ = self.push.send(record).await;
    }
}
