//! Gateway between a running simulation and the analytics backend.
//!
//! Fronts an object-storage pool and offers three services over TCP: a live
//! stream of new-artifact notifications, a structured index of everything in
//! the pool, and on-demand object retrieval with content hashes. See
//! `DESIGN.md` at the repository root for the component map.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod cluster;
pub mod index;
pub mod ingest;
pub mod keys;
pub mod logging;
pub mod protocol;
pub mod refresher;
pub mod selftest;

use backend::BackendEndpoint;
use cluster::{Arbiter, ClusterHandle, PoolPlan};
use index::IndexStore;
use ingest::IngestEndpoint;
use refresher::Refresher;

/// Everything needed to boot a gateway besides the cluster handle.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backend_addr: SocketAddr,
    pub simulation_addr: SocketAddr,
    pub pool_plan: PoolPlan,
    /// Delay before the very first index sweep.
    pub sweep_warmup: Duration,
    /// Period of the recurring index sweep.
    pub sweep_interval: Duration,
}

impl GatewayConfig {
    pub fn on_ports(backend_port: u16, simulation_port: u16) -> Self {
        Self {
            backend_addr: SocketAddr::from(([0, 0, 0, 0], backend_port)),
            simulation_addr: SocketAddr::from(([0, 0, 0, 0], simulation_port)),
            pool_plan: PoolPlan::default(),
            sweep_warmup: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

/// A running gateway: the five component tasks plus the shutdown token.
pub struct Gateway {
    pub backend_addr: SocketAddr,
    pub simulation_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    arbiter: Arbiter,
}

impl Gateway {
    /// Bind both listeners, wire the channels and spawn every component.
    ///
    /// Fails when a port cannot be bound; cluster reachability is checked by
    /// the launcher before this is called.
    pub async fn start(
        config: GatewayConfig,
        cluster: Arc<dyn ClusterHandle>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let backend_listener = tokio::net::TcpListener::bind(config.backend_addr)
            .await
            .with_context(|| format!("failed to bind backend port {}", config.backend_addr))?;
        let simulation_listener = tokio::net::TcpListener::bind(config.simulation_addr)
            .await
            .with_context(|| {
                format!("failed to bind simulation port {}", config.simulation_addr)
            })?;
        let backend_addr = backend_listener.local_addr()?;
        let simulation_addr = simulation_listener.local_addr()?;

        // Streams between the components. All queues are bounded with slack;
        // flow control happens through the no-listener drains rather than
        // backpressure.
        let (push_tx, push_rx) = mpsc::channel(1024);
        let (sweep_tx, sweep_rx) = mpsc::channel(4);
        let (index_result_tx, index_result_rx) = mpsc::channel(4);

        let (store, channels) = IndexStore::new(
            push_tx,
            sweep_tx,
            config.sweep_warmup,
            config.sweep_interval,
        );

        let arbiter = Arbiter::spawn(
            cluster,
            config.pool_plan.clone(),
            channels.hash_answers.clone(),
            index_result_tx,
            shutdown.clone(),
        );
        let handles = arbiter.handles();

        let refresher = Refresher::new(
            handles.clone(),
            sweep_rx,
            index_result_rx,
            channels.refresher.clone(),
        );
        let ingest = IngestEndpoint::new(simulation_listener, channels.ingest.clone());
        let endpoint = BackendEndpoint::new(backend_listener, handles.clone(), channels.requests.clone());

        let tasks = vec![
            tokio::spawn(store.run(handles, shutdown.clone())),
            tokio::spawn(refresher.run(shutdown.clone())),
            tokio::spawn(ingest.run(shutdown.clone())),
            tokio::spawn(endpoint.run(push_rx, shutdown.clone())),
        ];

        Ok(Self {
            backend_addr,
            simulation_addr,
            shutdown,
            tasks,
            arbiter,
        })
    }

    /// Signal every component and wait for the tasks to drain.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.arbiter.join().await;
    }

    /// Wait until all component tasks have exited (after an external cancel).
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
        self.arbiter.join().await;
    }
}
