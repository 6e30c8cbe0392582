//! The framed exchange used on every backend connection.
//!
//! One message is four wire steps, each direction interlocked:
//!
//! 1. sender writes an 8-byte little-endian length prefix,
//! 2. receiver answers `ack` (or `nack`, aborting the message),
//! 3. sender writes that many bytes of UTF-8 JSON,
//! 4. receiver answers `ack`/`nack` again.
//!
//! Tokens are lowercase on the wire; anything that is not exactly `ack` is
//! treated as a nack, which rejects the legacy upper-case `ACK`/`NAK`
//! variants by construction. A nack aborts the current message only, the
//! connection stays usable.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Budget for each control read (length prefix of an expected reply, ack
/// tokens, payload bytes). The wait for a *request* frame is unbounded; a
/// conversation may sit idle for as long as the backend likes.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Refuse frames beyond this size before attempting to allocate them.
const MAX_FRAME: u64 = 1 << 31;

const ACK: &[u8; 3] = b"ack";
const NACK: &[u8; 4] = b"nack";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the connection at a message boundary.
    #[error("connection closed")]
    Closed,
    /// The peer rejected our length prefix or payload.
    #[error("peer answered nack")]
    Nacked,
    #[error("frame protocol violation: {0}")]
    Protocol(String),
    #[error("timed out during framed exchange")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

fn classify(err: std::io::Error) -> FrameError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Closed
    } else {
        FrameError::Io(err)
    }
}

async fn timed<T>(
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(EXCHANGE_TIMEOUT, fut).await {
        Ok(result) => result.map_err(classify),
        Err(_) => Err(FrameError::Timeout),
    }
}

async fn send_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    timed(async {
        writer.write_all(ACK).await?;
        writer.flush().await
    })
    .await
}

async fn send_nack<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    timed(async {
        writer.write_all(NACK).await?;
        writer.flush().await
    })
    .await
}

/// Read the peer's ack/nack. `ack` is three bytes and `nack` four, so the
/// token is disambiguated after reading the third byte.
async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool> {
    let mut token = [0u8; 3];
    timed(reader.read_exact(&mut token)).await?;
    if token == *ACK {
        return Ok(true);
    }
    if token[..] == NACK[..3] {
        let mut tail = [0u8; 1];
        timed(reader.read_exact(&mut tail)).await?;
        if tail[0] == NACK[3] {
            return Ok(false);
        }
    }
    Err(FrameError::Protocol(format!(
        "unrecognized status token {:?}",
        String::from_utf8_lossy(&token)
    )))
}

/// Send one framed JSON payload, observing the peer's acks.
pub async fn send_frame<R, W>(reader: &mut R, writer: &mut W, payload: &[u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let length = (payload.len() as u64).to_le_bytes();
    timed(async {
        writer.write_all(&length).await?;
        writer.flush().await
    })
    .await?;

    if !read_ack(reader).await? {
        return Err(FrameError::Nacked);
    }

    timed(async {
        writer.write_all(payload).await?;
        writer.flush().await
    })
    .await?;

    if !read_ack(reader).await? {
        return Err(FrameError::Nacked);
    }
    Ok(())
}

/// Receive one framed JSON value, answering with acks/nacks as we go.
///
/// The leading length read waits indefinitely; everything after it is on the
/// exchange clock. Malformed lengths and undecodable payloads are nacked and
/// reported as [`FrameError::Protocol`]; the caller decides whether the
/// connection survives.
pub async fn read_frame<R, W>(reader: &mut R, writer: &mut W) -> Result<serde_json::Value>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut length = [0u8; 8];
    reader.read_exact(&mut length).await.map_err(classify)?;
    let length = u64::from_le_bytes(length);

    if length == 0 || length > MAX_FRAME {
        send_nack(writer).await?;
        return Err(FrameError::Protocol(format!("refused frame length {length}")));
    }
    send_ack(writer).await?;

    let mut payload = vec![0u8; length as usize];
    match timed(reader.read_exact(&mut payload)).await {
        Ok(_) => {}
        Err(err) => {
            let _ = send_nack(writer).await;
            return Err(err);
        }
    }

    match serde_json::from_slice(&payload) {
        Ok(value) => {
            send_ack(writer).await?;
            Ok(value)
        }
        Err(err) => {
            send_nack(writer).await?;
            Err(FrameError::Protocol(format!("payload is not JSON: {err}")))
        }
    }
}

/// Serialize `message` and send it as one frame.
pub async fn send_json<R, W, T>(reader: &mut R, writer: &mut W, message: &T) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let payload = serde_json::to_vec(message)
        .map_err(|err| FrameError::Protocol(format!("unencodable message: {err}")))?;
    send_frame(reader, writer, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);

        let send = tokio::spawn(async move {
            send_json(
                &mut client_r,
                &mut client_w,
                &serde_json::json!({"todo": "index"}),
            )
            .await
        });

        let received = read_frame(&mut server_r, &mut server_w).await.unwrap();
        assert_eq!(received, serde_json::json!({"todo": "index"}));
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_json_payload_is_nacked() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);

        let send = tokio::spawn(async move {
            let result = send_frame(&mut client_r, &mut client_w, b"not json").await;
            assert!(matches!(result, Err(FrameError::Nacked)));
        });

        let result = read_frame(&mut server_r, &mut server_w).await;
        assert!(matches!(result, Err(FrameError::Protocol(_))));
        send.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_length_is_refused() {
        let (client, server) = tokio::io::duplex(4096);
        let (_client_r, mut client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);

        client_w.write_all(&u64::MAX.to_le_bytes()).await.unwrap();

        let result = read_frame(&mut server_r, &mut server_w).await;
        assert!(matches!(result, Err(FrameError::Protocol(_))));
    }

    #[tokio::test]
    async fn legacy_uppercase_ack_counts_as_protocol_error() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);

        let send = tokio::spawn(async move {
            send_frame(&mut client_r, &mut client_w, b"{}").await
        });

        // Answer the length prefix in the legacy casing.
        let mut length = [0u8; 8];
        server_r.read_exact(&mut length).await.unwrap();
        server_w.write_all(b"ACK").await.unwrap();

        let result = send.await.unwrap();
        assert!(matches!(result, Err(FrameError::Protocol(_))));
    }

    #[tokio::test]
    async fn eof_at_message_boundary_reads_as_closed() {
        let (client, server) = tokio::io::duplex(4096);
        drop(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);

        let result = read_frame(&mut server_r, &mut server_w).await;
        assert!(matches!(result, Err(FrameError::Closed)));
    }
}
