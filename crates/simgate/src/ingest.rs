//! TCP endpoint the simulation announces new artifacts on.
//!
//! Every accepted connection is a one-shot: a single read of at most 1 KiB,
//! split on TAB into `namespace`, `key` and `sha1sum`, then the socket is
//! closed. There is no reply and no framing; anything malformed is dropped
//! with a debug log so a misbehaving producer cannot wedge the endpoint.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::index::NewFile;

const MAX_ANNOUNCEMENT: usize = 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IngestEndpoint {
    listener: TcpListener,
    store: mpsc::Sender<NewFile>,
}

impl IngestEndpoint {
    pub fn new(listener: TcpListener, store: mpsc::Sender<NewFile>) -> Self {
        Self { listener, store }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(target: "SIMULATION", %addr, "listening for simulation announcements");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let Ok((socket, peer)) = accepted else {
                        continue;
                    };
                    tracing::debug!(target: "SIMULATION", %peer, "connection established");
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        handle_announcement(socket, store).await;
                        tracing::debug!(target: "SIMULATION", %peer, "connection closed");
                    });
                }
            }
        }

        tracing::info!(target: "SIMULATION", "simulation endpoint down");
    }
}

async fn handle_announcement(mut socket: TcpStream, store: mpsc::Sender<NewFile>) {
    let mut buf = vec![0u8; MAX_ANNOUNCEMENT];

    let read = tokio::time::timeout(READ_TIMEOUT, socket.read(&mut buf)).await;
    let len = match read {
        Ok(Ok(len)) => len,
        Ok(Err(err)) => {
            tracing::debug!(target: "SIMULATION", %err, "failed reading announcement");
            return;
        }
        Err(_) => {
            tracing::debug!(target: "SIMULATION", "timed out waiting for announcement");
            return;
        }
    };

    if len == 0 {
        tracing::debug!(target: "SIMULATION", "received package is empty");
        return;
    }

    let Some(record) = parse_announcement(&buf[..len]) else {
        tracing::debug!(target: "SIMULATION", "received package is not formatted correctly");
        return;
    };

    tracing::debug!(
        target: "SIMULATION",
        namespace = %record.namespace,
        key = %record.key,
        "new file announced"
    );
    let _ = store.send(record).await;
}

/// Decode one announcement: UTF-8, exactly three TAB-separated fields.
fn parse_announcement(payload: &[u8]) -> Option<NewFile> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut fields = text.split('\t');
    let namespace = fields.next()?;
    let key = fields.next()?;
    let sha1sum = fields.next()?;
    if fields.next().is_some() || namespace.is_empty() || key.is_empty() {
        return None;
    }
    Some(NewFile {
        namespace: namespace.to_string(),
        key: key.to_string(),
        sha1sum: sha1sum.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_announcement() {
        let record = parse_announcement(b"ns1\tuniverse.fo.eo.nodes@1.0\tdeadbeef").unwrap();
        assert_eq!(record.namespace, "ns1");
        assert_eq!(record.key, "universe.fo.eo.nodes@1.0");
        assert_eq!(record.sha1sum, "deadbeef");
    }

    #[test]
    fn empty_hash_field_is_allowed() {
        let record = parse_announcement(b"ns1\tuniverse.fo.eo.nodes@1.0\t").unwrap();
        assert_eq!(record.sha1sum, "");
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert!(parse_announcement(b"ns1\tkey-only").is_none());
        assert!(parse_announcement(b"ns1\tkey\thash\textra").is_none());
        assert!(parse_announcement(b"no tabs at all").is_none());
    }

    #[test]
    fn non_utf8_is_rejected() {
        assert!(parse_announcement(&[0xff, 0xfe, b'\t', b'x', b'\t', b'y']).is_none());
    }
}
