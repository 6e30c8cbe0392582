//! End-to-end tests over real sockets: a seeded in-memory cluster behind the
//! full gateway, driven the way the simulation and the backend drive it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use simgate::cluster::MemoryCluster;
use simgate::protocol::ConversationKind;
use simgate::selftest::{announce, BackendClient};
use simgate::{Gateway, GatewayConfig};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

async fn boot(cluster: MemoryCluster) -> Gateway {
    let mut config = GatewayConfig::on_ports(0, 0);
    config.backend_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.simulation_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    // Tests trigger sweeps through announcements; keep the timer quiet.
    config.sweep_warmup = Duration::from_secs(3600);

    Gateway::start(config, Arc::new(cluster), CancellationToken::new())
        .await
        .expect("gateway must start on loopback")
}

async fn read_with_timeout(client: &mut BackendClient) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), client.read())
        .await
        .expect("timed out waiting for frame")
        .expect("frame read failed")
}

#[tokio::test]
async fn index_round_trip_over_backend_socket() {
    let gateway = boot(MemoryCluster::new()).await;
    let mut push =
        BackendClient::connect(gateway.backend_addr, ConversationKind::NewFileMessage)
            .await
            .unwrap();
    // Let the conversation claim the push slot before announcing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The three canonical shapes: plain nodes with a key prefix, elemental
    // with field and elemtype, and a legacy nodal key without a simtype.
    for (namespace, key, sha1sum) in [
        ("ns1", "x/universe.fo.eo.nodes@000000001.000000", "aaa"),
        ("ns1", "universe.fo.eo.elemental.z1.c3d8@000000002.000000", "abc"),
        ("eo_mesh", "universe.fo.nodal.z1.eo@000000000.000000", "bbb"),
    ] {
        announce(gateway.simulation_addr, namespace, key, sha1sum)
            .await
            .unwrap();
        // Wait until the store has absorbed it before sending the next one.
        read_with_timeout(&mut push).await;
    }

    let mut index =
        BackendClient::connect(gateway.backend_addr, ConversationKind::Index).await.unwrap();
    index.send(&serde_json::json!({"todo": "index"})).await.unwrap();
    let reply = read_with_timeout(&mut index).await;

    assert_eq!(reply["todo"], "index");
    let tree = reply["index"].as_object().unwrap();
    let mut namespaces: Vec<_> = tree.keys().cloned().collect();
    namespaces.sort();
    assert_eq!(namespaces, vec!["eo_mesh", "ns1"]);

    assert_eq!(
        tree["ns1"]["000000001.000000"]["eo"]["nodes"],
        serde_json::json!({
            "object_key": "x/universe.fo.eo.nodes@000000001.000000",
            "sha1sum": "aaa"
        })
    );
    assert_eq!(
        tree["ns1"]["000000002.000000"]["eo"]["elemental"]["z1"]["c3d8"]["sha1sum"],
        "abc"
    );
    assert_eq!(
        tree["eo_mesh"]["000000000.000000"]["nodal"]["z1"]["eo"]["object_key"],
        "universe.fo.nodal.z1.eo@000000000.000000"
    );

    gateway.stop().await;
}

#[tokio::test]
async fn file_download_contents_match_hash_tag() {
    let cluster = MemoryCluster::new();
    let key = "universe.fo.m.nodes@000000001.000000";
    cluster.put_object("nsX", key, &b"some simulation bytes"[..]);

    let gateway = boot(cluster.clone()).await;

    // Announce without a hash; the gateway fills it in from the cluster.
    announce(gateway.simulation_addr, "nsX", key, "").await.unwrap();

    let mut download =
        BackendClient::connect(gateway.backend_addr, ConversationKind::FileDownload)
            .await
            .unwrap();
    download
        .send(&serde_json::json!({
            "requested_file": {"namespace": "nsX", "key": key}
        }))
        .await
        .unwrap();
    let answer = read_with_timeout(&mut download).await;

    assert_eq!(answer["todo"], "file_request");
    let body = &answer["file_request"];
    assert_eq!(body["namespace"], "nsX");
    assert_eq!(body["object"], key);

    let contents = base64::decode(body["contents"].as_str().unwrap()).unwrap();
    assert_eq!(contents, b"some simulation bytes");

    let expected = hex::encode(Sha1::digest(&contents));
    assert_eq!(body["tags"]["sha1sum"], expected.as_str());

    // The computed hash was persisted back to the cluster.
    assert_eq!(
        cluster.xattr("nsX", key, "sha1sum"),
        Some(expected.into_bytes())
    );

    gateway.stop().await;
}

#[tokio::test]
async fn every_connected_push_conversation_receives_the_announcement() {
    let gateway = boot(MemoryCluster::new()).await;

    let mut first =
        BackendClient::connect(gateway.backend_addr, ConversationKind::NewFileMessage)
            .await
            .unwrap();
    let mut second =
        BackendClient::connect(gateway.backend_addr, ConversationKind::NewFileMessage)
            .await
            .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    announce(
        gateway.simulation_addr,
        "ns",
        "universe.fo.eo.nodes@000000001.000000",
        "aa",
    )
    .await
    .unwrap();

    for client in [&mut first, &mut second] {
        let pushed = read_with_timeout(client).await;
        assert_eq!(pushed["todo"], "new_file");
        assert_eq!(pushed["new_file"]["key"], "universe.fo.eo.nodes@000000001.000000");
    }

    gateway.stop().await;
}

#[tokio::test]
async fn reconnect_does_not_replay_missed_pushes() {
    let gateway = boot(MemoryCluster::new()).await;

    let first =
        BackendClient::connect(gateway.backend_addr, ConversationKind::NewFileMessage)
            .await
            .unwrap();
    drop(first);
    // Give the conversation a moment to observe the hangup.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // These records have no listener; the gateway discards them.
    for step in 0..5 {
        announce(
            gateway.simulation_addr,
            "ns",
            &format!("universe.fo.eo.nodes@00000000{step}.000000"),
            "aa",
        )
        .await
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut second =
        BackendClient::connect(gateway.backend_addr, ConversationKind::NewFileMessage)
            .await
            .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    announce(
        gateway.simulation_addr,
        "ns",
        "universe.fo.eo.nodes@000000009.000000",
        "bb",
    )
    .await
    .unwrap();

    let pushed = read_with_timeout(&mut second).await;
    assert_eq!(
        pushed["new_file"]["key"],
        "universe.fo.eo.nodes@000000009.000000",
        "stale records must not be replayed after reconnect"
    );

    gateway.stop().await;
}

#[tokio::test]
async fn ingest_boundaries() {
    let gateway = boot(MemoryCluster::new()).await;
    let mut push =
        BackendClient::connect(gateway.backend_addr, ConversationKind::NewFileMessage)
            .await
            .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Empty payload: connection closes without effect.
    let mut empty = tokio::net::TcpStream::connect(gateway.simulation_addr).await.unwrap();
    empty.shutdown().await.unwrap();

    // Oversized payload: the third field starts past the 1 KiB read, so the
    // truncated payload has two fields and is dropped.
    let oversized = format!("ns\t{}\thash", "k".repeat(1500));
    let mut big = tokio::net::TcpStream::connect(gateway.simulation_addr).await.unwrap();
    big.write_all(oversized.as_bytes()).await.unwrap();
    big.shutdown().await.unwrap();

    // Exactly 1024 bytes: processed.
    let tail = "/universe.fo.eo.nodes@000000004.000000";
    let fixed = "ns\t\taa".len() + tail.len();
    let exact_key = format!("{}{}", "p".repeat(1024 - fixed), tail);
    let payload = format!("ns\t{exact_key}\taa");
    assert_eq!(payload.len(), 1024);
    announce(gateway.simulation_addr, "ns", &exact_key, "aa").await.unwrap();

    let pushed = read_with_timeout(&mut push).await;
    assert_eq!(pushed["new_file"]["key"], exact_key.as_str());

    gateway.stop().await;
}

#[tokio::test]
async fn ten_concurrent_announcements_all_land_in_the_index() {
    let gateway = boot(MemoryCluster::new()).await;

    let mut tasks = Vec::new();
    for step in 0..10 {
        let addr = gateway.simulation_addr;
        tasks.push(tokio::spawn(async move {
            announce(
                addr,
                "ns",
                &format!("universe.fo.eo.nodal.field{step}@000000001.000000"),
                "aa",
            )
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut index =
        BackendClient::connect(gateway.backend_addr, ConversationKind::Index).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        index.send(&serde_json::json!({"todo": "index"})).await.unwrap();
        let reply = read_with_timeout(&mut index).await;
        let nodal = &reply["index"]["ns"]["000000001.000000"]["eo"]["nodal"];
        let count = nodal.as_object().map(|fields| fields.len()).unwrap_or(0);
        if count == 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {count} of 10 announcements present in the index"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    gateway.stop().await;
}

#[tokio::test]
async fn index_request_before_first_sweep_returns_empty_tree() {
    let cluster = MemoryCluster::new();
    cluster.put_object("ns", "universe.fo.eo.nodes@1.0", &b"x"[..]);

    let gateway = boot(cluster).await;
    let mut index =
        BackendClient::connect(gateway.backend_addr, ConversationKind::Index).await.unwrap();
    index.send(&serde_json::json!({"todo": "index"})).await.unwrap();
    let reply = read_with_timeout(&mut index).await;

    assert_eq!(reply["index"], serde_json::json!({}));

    gateway.stop().await;
}
