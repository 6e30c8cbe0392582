//! Periodically rebuilds the index from the cluster.
//!
//! The refresher itself is a thin scheduler: every trigger from the index
//! store turns into one `ReadIndex` task for the arbiter, and the assembled
//! result is streamed record-by-record into the store. During a sweep the
//! store channel can carry thousands of records per second; the store drains
//! them in batches so the sweep is never blocked here for long.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ArbiterHandles, IndexResult, SHA1SUM_XATTR};
use crate::index::NewFile;

pub struct Refresher {
    arbiter: ArbiterHandles,
    trigger_rx: mpsc::Receiver<()>,
    results_rx: mpsc::Receiver<IndexResult>,
    store: mpsc::Sender<NewFile>,
}

impl Refresher {
    pub fn new(
        arbiter: ArbiterHandles,
        trigger_rx: mpsc::Receiver<()>,
        results_rx: mpsc::Receiver<IndexResult>,
        store: mpsc::Sender<NewFile>,
    ) -> Self {
        Self {
            arbiter,
            trigger_rx,
            results_rx,
            store,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                trigger = self.trigger_rx.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    self.sweep(&shutdown).await;
                }
            }
        }
        tracing::debug!(target: "CORE", "refresher down");
    }

    async fn sweep(&mut self, shutdown: &CancellationToken) {
        tracing::info!(target: "CORE", "requesting full index from cluster");
        self.arbiter.read_index().await;

        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = self.results_rx.recv() => match result {
                Some(result) => result,
                None => return,
            },
        };

        let mut records = 0usize;
        for namespace_index in result.namespaces {
            for (key, tags) in namespace_index.objects {
                let sha1sum = tags.get(SHA1SUM_XATTR).cloned().unwrap_or_default();
                let record = NewFile {
                    namespace: namespace_index.namespace.clone(),
                    key,
                    sha1sum,
                };
                if self.store.send(record).await.is_err() {
                    return;
                }
                records += 1;
            }
        }
        tracing::info!(target: "CORE", records, "index sweep forwarded to store");
    }
}
