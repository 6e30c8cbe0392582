//! Launcher: deliver data from the storage cluster to the analytics backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use simgate::cluster::CliCluster;
use simgate::logging::{self, LogLevel};
use simgate::{Gateway, GatewayConfig};

/// Deliver simulation artifacts from the object-storage cluster to the
/// analytics backend.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Path to the cluster configuration (keyring) file.
    #[arg(short, long, required_unless_present = "test")]
    config: Option<PathBuf>,
    /// Name of the storage pool.
    #[arg(short, long, required_unless_present = "test")]
    pool: Option<String>,
    /// Cluster user name.
    #[arg(short, long, required_unless_present = "test")]
    user: Option<String>,
    /// The port on which the backend connects.
    #[arg(short, long, default_value_t = 8009)]
    backend_port: u16,
    /// The port on which the simulation can connect.
    #[arg(short, long, default_value_t = 8010)]
    simulation_port: u16,
    /// Set the logging level.
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    log: LogLevel,
    /// How often the index is rebuilt from the cluster.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
    sweep_interval: Duration,
    /// Perform the embedded self-test and exit afterwards.
    #[arg(long)]
    test: bool,
}

const BANNER: &str = r#"
    +------------------------------------------+
    |                                          |
    |       This is the simgate server.        |
    |                                          |
    |    Connect the analytics backend to      |
    |       receive simulation data.           |
    |                                          |
    +------------------------------------------+
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.test {
        logging::install(LogLevel::Warning);
        return simgate::selftest::run().await;
    }

    println!("{BANNER}");
    logging::install(cli.log);
    tracing::info!(target: "CORE", level = ?cli.log, "logging started");

    // The `required_unless_present` rules guarantee these once --test is off.
    let config = cli.config.expect("clap enforces --config");
    let pool = cli.pool.expect("clap enforces --pool");
    let user = cli.user.expect("clap enforces --user");

    let cluster = CliCluster::new(config, pool, user);
    cluster
        .connect_check()
        .await
        .context("cluster handshake failed")?;
    tracing::info!(target: "CORE", "cluster reachable");

    let mut gateway_config = GatewayConfig::on_ports(cli.backend_port, cli.simulation_port);
    gateway_config.sweep_interval = cli.sweep_interval;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let gateway = Gateway::start(gateway_config, Arc::new(cluster), shutdown.clone()).await?;

    let interrupt_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            tracing::info!(target: "CORE", "detected interrupt -- shutting down");
            interrupt_token.cancel();
        }
    });

    gateway.join().await;
    Ok(())
}
