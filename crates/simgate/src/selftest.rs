//! Embedded end-to-end smoke suite, run by `--test`.
//!
//! Boots the complete gateway on loopback ports against a seeded in-memory
//! cluster and drives it exactly like a backend and a simulation would: raw
//! TCP announcements on one side, framed conversations on the other. Prints
//! one line per check and reports failure through the exit status.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::backend::frame;
use crate::cluster::MemoryCluster;
use crate::protocol::{ConversationKind, Handshake, IndexRequestMessage};
use crate::{Gateway, GatewayConfig};

/// A minimal backend-side client for one conversation.
pub struct BackendClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl BackendClient {
    /// Connect and perform the handshake for `kind`.
    pub async fn connect(addr: SocketAddr, kind: ConversationKind) -> anyhow::Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        let (reader, writer) = socket.into_split();
        let mut client = Self { reader, writer };
        client.send(&Handshake { task: kind }).await?;
        Ok(client)
    }

    pub async fn send<T: serde::Serialize>(&mut self, message: &T) -> frame::Result<()> {
        frame::send_json(&mut self.reader, &mut self.writer, message).await
    }

    pub async fn read(&mut self) -> frame::Result<serde_json::Value> {
        frame::read_frame(&mut self.reader, &mut self.writer).await
    }
}

/// Announce a new artifact the way the simulation does: one connection, one
/// unframed TAB-separated line, close.
pub async fn announce(
    addr: SocketAddr,
    namespace: &str,
    key: &str,
    sha1sum: &str,
) -> anyhow::Result<()> {
    let mut socket = TcpStream::connect(addr).await?;
    socket
        .write_all(format!("{namespace}\t{key}\t{sha1sum}").as_bytes())
        .await?;
    socket.shutdown().await?;
    Ok(())
}

/// Run the suite; `Err` carries the first failed check.
pub async fn run() -> anyhow::Result<()> {
    let cluster = MemoryCluster::new();
    cluster.put_object("nsX", "universe.fo.m.nodes@000000001.000000", &b"selftest object"[..]);

    let mut config = GatewayConfig::on_ports(0, 0);
    config.backend_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.simulation_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    // The suite triggers everything it needs explicitly; keep the periodic
    // sweep out of the way.
    config.sweep_warmup = Duration::from_secs(3600);

    let shutdown = CancellationToken::new();
    let gateway = Gateway::start(config, Arc::new(cluster.clone()), shutdown.clone())
        .await
        .context("failed to start gateway")?;

    let result = checks(&gateway, &cluster).await;
    gateway.stop().await;

    match &result {
        Ok(()) => println!("--- all checks passed ---"),
        Err(err) => println!("--- FAILED: {err:#} ---"),
    }
    result
}

async fn checks(gateway: &Gateway, cluster: &MemoryCluster) -> anyhow::Result<()> {
    let expected_hash = hex::encode(Sha1::digest(b"selftest object"));

    // Push conversation sees an announcement that carries its hash.
    let mut push = BackendClient::connect(gateway.backend_addr, ConversationKind::NewFileMessage)
        .await
        .context("connecting push conversation")?;
    // Let the conversation claim the push slot before announcing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    announce(
        gateway.simulation_addr,
        "nsY",
        "universe.fo.eo.nodes@000000002.000000",
        "cafebabe",
    )
    .await?;
    let pushed = tokio::time::timeout(Duration::from_secs(5), push.read())
        .await
        .context("no push within 5s")??;
    anyhow::ensure!(
        pushed["todo"] == "new_file" && pushed["new_file"]["sha1sum"] == "cafebabe",
        "unexpected push payload: {pushed}"
    );
    println!("check: announcement reaches push conversation .. ok");

    // An announcement without a hash gets one from the cluster.
    announce(
        gateway.simulation_addr,
        "nsX",
        "universe.fo.m.nodes@000000001.000000",
        "",
    )
    .await?;
    let pushed = tokio::time::timeout(Duration::from_secs(5), push.read())
        .await
        .context("no hash-lookup push within 5s")??;
    anyhow::ensure!(
        pushed["new_file"]["sha1sum"] == expected_hash.as_str(),
        "hash lookup produced {pushed}"
    );
    println!("check: missing hash filled from cluster ........ ok");

    // The index now contains both announcements.
    let mut index = BackendClient::connect(gateway.backend_addr, ConversationKind::Index).await?;
    index
        .send(&IndexRequestMessage {
            todo: "index".to_string(),
        })
        .await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), index.read())
        .await
        .context("no index reply within 5s")??;
    let tree = &reply["index"];
    anyhow::ensure!(
        tree["nsY"]["000000002.000000"]["eo"]["nodes"]["object_key"]
            == "universe.fo.eo.nodes@000000002.000000",
        "announced object missing from index: {reply}"
    );
    anyhow::ensure!(
        tree["nsX"]["000000001.000000"]["m"]["nodes"]["sha1sum"] == expected_hash.as_str(),
        "cluster hash missing from index: {reply}"
    );
    println!("check: index round trip ........................ ok");

    // File download returns the object bytes and matching hash.
    let mut download =
        BackendClient::connect(gateway.backend_addr, ConversationKind::FileDownload).await?;
    download
        .send(&serde_json::json!({
            "requested_file": {
                "namespace": "nsX",
                "key": "universe.fo.m.nodes@000000001.000000",
            }
        }))
        .await?;
    let answer = tokio::time::timeout(Duration::from_secs(5), download.read())
        .await
        .context("no file answer within 5s")??;
    let body = &answer["file_request"];
    let contents = base64::decode(body["contents"].as_str().unwrap_or_default())
        .context("contents are not base64")?;
    anyhow::ensure!(contents == b"selftest object", "wrong object contents");
    anyhow::ensure!(
        body["tags"]["sha1sum"] == expected_hash.as_str(),
        "wrong sha1sum tag: {answer}"
    );
    anyhow::ensure!(
        cluster.xattr("nsX", "universe.fo.m.nodes@000000001.000000", "sha1sum")
            == Some(expected_hash.clone().into_bytes()),
        "computed hash was not persisted to the cluster"
    );
    println!("check: file download round trip ................ ok");

    Ok(())
}
