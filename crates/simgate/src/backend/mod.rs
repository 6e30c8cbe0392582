//! TCP endpoint the analytics backend connects to.
//!
//! Every connection starts with a framed handshake naming its conversation.
//! A backend instance keeps several connections open in parallel, one per
//! conversation, and each conversation is a long-lived loop owned by its own
//! task under a child cancellation token.

pub mod frame;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cluster::ArbiterHandles;
use crate::index::{IndexRequest, NewFile};
use crate::protocol::{
    ConversationKind, FileAnswer, FileRequest, Handshake, IndexReply, NewFilePush,
};
use frame::FrameError;

/// How long the index store gets to produce a snapshot.
const INDEX_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a dispatched object read may take before the conversation gives
/// up on it; the read itself is not cancelled, its result is simply dropped.
const FILE_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// The roster push conversations register their senders in. Usually one
/// entry per connected backend instance.
type PushRoster = Arc<Mutex<Vec<mpsc::Sender<NewFile>>>>;

pub struct BackendEndpoint {
    listener: TcpListener,
    arbiter: ArbiterHandles,
    requests: mpsc::Sender<IndexRequest>,
    push_roster: PushRoster,
}

impl BackendEndpoint {
    pub fn new(
        listener: TcpListener,
        arbiter: ArbiterHandles,
        requests: mpsc::Sender<IndexRequest>,
    ) -> Self {
        Self {
            listener,
            arbiter,
            requests,
            push_roster: Arc::default(),
        }
    }

    /// Drive the listener plus the push distributor until shutdown.
    ///
    /// `push_rx` is the store's new-file stream. While no `new_file_message`
    /// conversation is registered the distributor drains and discards it, so
    /// a backend that reconnects is not greeted by a stale burst; it recovers
    /// missed events with a fresh index request instead.
    pub async fn run(self, push_rx: mpsc::Receiver<NewFile>, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(target: "BACKEND", %addr, "listening for backend connections");
        }

        let distributor = tokio::spawn(distribute_pushes(
            push_rx,
            self.push_roster.clone(),
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let Ok((socket, peer)) = accepted else {
                        continue;
                    };
                    tracing::info!(target: "BACKEND", %peer, "connection open");

                    let conversation = Conversation {
                        arbiter: self.arbiter.clone(),
                        requests: self.requests.clone(),
                        push_roster: self.push_roster.clone(),
                    };
                    let stop = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = conversation.serve(socket, stop).await {
                            tracing::debug!(target: "BACKEND", %peer, %err, "conversation ended");
                        }
                        tracing::info!(target: "BACKEND", %peer, "connection closed");
                    });
                }
            }
        }

        let _ = distributor.await;
        tracing::info!(target: "BACKEND", "backend endpoint down");
    }
}

/// Forward each new-file record to every registered push conversation, or
/// drop it on the floor when none is attached.
async fn distribute_pushes(
    mut push_rx: mpsc::Receiver<NewFile>,
    roster: PushRoster,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = push_rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        let senders = roster.lock().await.clone();
        if senders.is_empty() {
            tracing::debug!(target: "BACKEND", "no push conversation attached, discarding record");
            continue;
        }

        let mut lost_one = false;
        for sender in senders {
            if sender.send(record.clone()).await.is_err() {
                lost_one = true;
            }
        }
        if lost_one {
            // A conversation went away; forget it so the queue keeps
            // draining until the next one registers.
            roster.lock().await.retain(|sender| !sender.is_closed());
        }
    }
}

struct Conversation {
    arbiter: ArbiterHandles,
    requests: mpsc::Sender<IndexRequest>,
    push_roster: PushRoster,
}

impl Conversation {
    async fn serve<S>(self, socket: S, stop: CancellationToken) -> frame::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(socket);

        // Handshake: the first framed message names the conversation.
        let handshake = frame::read_frame(&mut reader, &mut writer).await?;
        let handshake: Handshake = match serde_json::from_value(handshake) {
            Ok(handshake) => handshake,
            Err(err) => {
                tracing::warn!(target: "BACKEND", %err, "unrecognized handshake");
                return Ok(());
            }
        };
        tracing::info!(target: "BACKEND", task = ?handshake.task, "conversation established");

        match handshake.task {
            ConversationKind::NewFileMessage => self.push_loop(reader, writer, stop).await,
            ConversationKind::Index => self.index_loop(reader, writer, stop).await,
            ConversationKind::FileDownload => self.download_loop(reader, writer, stop).await,
        }
    }

    /// One-way server push. The select below doubles as the connection
    /// watchdog: a zero-byte read means the backend hung up, which removes
    /// this conversation from the roster so the distributor resumes draining.
    async fn push_loop<S>(
        &self,
        mut reader: ReadHalf<S>,
        mut writer: WriteHalf<S>,
        stop: CancellationToken,
    ) -> frame::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<NewFile>(256);
        let registered = tx.clone();
        self.push_roster.lock().await.push(tx);

        let result = async {
            let mut probe = [0u8; 1];
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return Ok(()),
                    read = reader.read(&mut probe) => {
                        match read {
                            Ok(0) | Err(_) => return Err(FrameError::Closed),
                            Ok(_) => {
                                // The backend has nothing to say on this
                                // conversation outside of frame acks.
                                tracing::debug!(target: "BACKEND", "unexpected byte on push conversation");
                            }
                        }
                    }
                    record = rx.recv() => {
                        let Some(record) = record else { return Ok(()) };
                        tracing::debug!(
                            target: "BACKEND",
                            namespace = %record.namespace,
                            key = %record.key,
                            "pushing new file to backend"
                        );
                        frame::send_json(&mut reader, &mut writer, &NewFilePush::new(record)).await?;
                    }
                }
            }
        }
        .await;

        // Unregister; with the roster empty the distributor goes back to
        // discarding.
        rx.close();
        self.push_roster
            .lock()
            .await
            .retain(|sender| !sender.same_channel(&registered));

        result
    }

    /// Request/reply: `{"todo":"index"}` in, full snapshot out.
    async fn index_loop<S>(
        &self,
        mut reader: ReadHalf<S>,
        mut writer: WriteHalf<S>,
        stop: CancellationToken,
    ) -> frame::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let request = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                request = frame::read_frame(&mut reader, &mut writer) => request,
            };
            let request = match request {
                Ok(request) => request,
                Err(FrameError::Protocol(violation)) => {
                    tracing::debug!(target: "BACKEND", violation, "ignoring malformed index request");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if request.get("todo").and_then(|todo| todo.as_str()) != Some("index") {
                tracing::debug!(target: "BACKEND", %request, "not an index request");
                continue;
            }
            tracing::debug!(target: "BACKEND", "received index request");

            let (reply_tx, reply_rx) = oneshot::channel();
            let _ = self
                .requests
                .send(IndexRequest {
                    namespace: None,
                    reply: reply_tx,
                })
                .await;

            // If the backend drops the connection the next send fails and the
            // conversation unwinds; the store's reply lands on a dead oneshot.
            match tokio::time::timeout(INDEX_REPLY_TIMEOUT, reply_rx).await {
                Ok(Ok(snapshot)) => {
                    frame::send_json(&mut reader, &mut writer, &IndexReply::new(snapshot)).await?;
                }
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!(target: "BACKEND", "index snapshot did not arrive in time");
                }
            }
        }
    }

    /// Request/reply: object coordinate in, base64 contents plus tags out.
    async fn download_loop<S>(
        &self,
        mut reader: ReadHalf<S>,
        mut writer: WriteHalf<S>,
        stop: CancellationToken,
    ) -> frame::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let request = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                request = frame::read_frame(&mut reader, &mut writer) => request,
            };
            let request = match request {
                Ok(request) => request,
                Err(FrameError::Protocol(violation)) => {
                    tracing::debug!(target: "BACKEND", violation, "ignoring malformed file request");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let request: FileRequest = match serde_json::from_value(request) {
                Ok(request) => request,
                Err(err) => {
                    tracing::debug!(target: "BACKEND", %err, "not a file request");
                    continue;
                }
            };
            let coordinate = request.requested_file;
            tracing::debug!(
                target: "BACKEND",
                namespace = %coordinate.namespace,
                key = %coordinate.key,
                "file download requested"
            );

            let reply = self
                .arbiter
                .read_object_data(coordinate.namespace, coordinate.key)
                .await;

            match tokio::time::timeout(FILE_REPLY_TIMEOUT, reply).await {
                Ok(Ok(data)) => {
                    frame::send_json(&mut reader, &mut writer, &FileAnswer::new(data)).await?;
                }
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!(target: "BACKEND", "object read did not complete, dropping request");
                }
            }
        }
    }
}
