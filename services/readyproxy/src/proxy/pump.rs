//! Bidirectional byte pumping with half-close propagation.
//!
//! A forwarding session runs two independent pumps, one per direction. Each
//! pump owns the read half of its source and the write half of its
//! destination:
//!
//! ```text
//!  client.read ──pump──▶ backend.write
//!  client.write ◀──pump── backend.read
//! ```
//!
//! - end-of-stream on the source becomes a write shutdown on the destination
//! - read/write errors end that direction only, never the other one
//! - on exit a pump shuts down its source read half and leaves the
//!   destination alone; the destination's lifecycle belongs to the opposite
//!   pump, which owns its read half

use std::fmt;
use std::net::Shutdown;

use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::release::{ignore_release_error, ReleaseSite};

/// Size of each copied chunk.
pub const PUMP_CHUNK_SIZE: usize = 4096;

/// Direction of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Source reported end-of-stream; destination write half was shut down.
    Eof,
    /// Reading the source failed.
    ReadError,
    /// Writing the destination failed.
    WriteError,
    /// The pump task did not run to completion.
    Aborted,
}

/// Result of one pump direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOutcome {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Why the pump stopped.
    pub end: PumpEnd,
}

/// Copy `src` into `dst` until end-of-stream or an I/O error.
///
/// Errors are folded into the returned [`PumpOutcome`].
pub async fn pump(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    direction: Direction,
) -> PumpOutcome {
    let mut buf = vec![0u8; PUMP_CHUNK_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => {
                ignore_release_error(ReleaseSite::DestinationWriteShutdown, dst.shutdown().await);
                break PumpEnd::Eof;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(direction = %direction, error = %e, "Pump read failed");
                break PumpEnd::ReadError;
            }
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            debug!(direction = %direction, error = %e, "Pump write failed");
            break PumpEnd::WriteError;
        }
        bytes += n as u64;
    };

    // After a read error the destination is left open: the peer only learns
    // the session is over once the opposite pump ends, so a reset client
    // keeps the session active until the backend writes or closes.
    let source: &TcpStream = src.as_ref();
    ignore_release_error(
        ReleaseSite::SourceReadShutdown,
        SockRef::from(source).shutdown(Shutdown::Read),
    );
    drop(src);
    // Dropping a write half shuts it down; the opposite pump may still be
    // relaying into the peer, so leave the destination untouched.
    dst.forget();

    trace!(direction = %direction, bytes, end = ?end, "Pump finished");
    PumpOutcome { bytes, end }
}

/// Relay `client` and `backend` in both directions until both pumps finish.
///
/// Returns the client->backend and backend->client outcomes.
pub async fn forward(client: TcpStream, backend: TcpStream) -> (PumpOutcome, PumpOutcome) {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let upstream = tokio::spawn(pump(client_read, backend_write, Direction::ClientToBackend));
    let downstream = tokio::spawn(pump(backend_read, client_write, Direction::BackendToClient));

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    (settle(upstream), settle(downstream))
}

fn settle(result: Result<PumpOutcome, tokio::task::JoinError>) -> PumpOutcome {
    result.unwrap_or_else(|e| {
        debug!(error = %e, "Pump task failed");
        PumpOutcome {
            bytes: 0,
            end: PumpEnd::Aborted,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let near = TcpStream::connect(addr).await.unwrap();
        let (far, _) = listener.accept().await.unwrap();
        (near, far)
    }

    #[tokio::test]
    async fn test_pump_copies_and_propagates_eof() {
        let (mut writer, src) = connected_pair().await;
        let (dst, mut reader) = connected_pair().await;

        let (src_read, _src_write) = src.into_split();
        let (_dst_read, dst_write) = dst.into_split();
        let task = tokio::spawn(pump(src_read, dst_write, Direction::ClientToBackend));

        let payload = vec![7u8; PUMP_CHUNK_SIZE * 3 + 11];
        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.end, PumpEnd::Eof);
        assert_eq!(outcome.bytes, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_forward_is_transparent_both_ways() {
        let (mut client, client_side) = connected_pair().await;
        let (backend_side, mut backend) = connected_pair().await;
        let session = tokio::spawn(forward(client_side, backend_side));

        client.write_all(b"request bytes").await.unwrap();
        let mut buf = [0u8; 13];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request bytes");

        backend.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(client);
        drop(backend);
        let (up, down) = session.await.unwrap();
        assert_eq!(up.bytes, 13);
        assert_eq!(down.bytes, 8);
    }

    #[tokio::test]
    async fn test_forward_half_close_keeps_reply_path_open() {
        let (mut client, client_side) = connected_pair().await;
        let (backend_side, mut backend) = connected_pair().await;
        let session = tokio::spawn(forward(client_side, backend_side));

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut seen = Vec::new();
        backend.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"ping");

        backend.write_all(b"pong").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let (up, down) = session.await.unwrap();
        assert_eq!(up, PumpOutcome { bytes: 4, end: PumpEnd::Eof });
        assert_eq!(down, PumpOutcome { bytes: 4, end: PumpEnd::Eof });
    }

    #[tokio::test]
    async fn test_reset_source_ends_only_its_direction() {
        let (client, client_side) = connected_pair().await;
        let (backend_side, mut backend) = connected_pair().await;
        let session = tokio::spawn(forward(client_side, backend_side));

        SockRef::from(&client)
            .set_linger(Some(std::time::Duration::ZERO))
            .unwrap();
        drop(client);

        // The backend is not shut down by the failed direction.
        let mut buf = [0u8; 16];
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(200), backend.read(&mut buf))
                .await;
        assert!(waited.is_err());

        // The reply direction still runs until it fails on its own.
        backend.write_all(b"late").await.unwrap();
        let (up, down) = tokio::time::timeout(std::time::Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(up, PumpOutcome { bytes: 0, end: PumpEnd::ReadError });
        assert_eq!(down.end, PumpEnd::WriteError);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::ClientToBackend.to_string(), "client->backend");
        assert_eq!(Direction::BackendToClient.to_string(), "backend->client");
    }
}
