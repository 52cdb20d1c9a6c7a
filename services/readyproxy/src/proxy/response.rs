//! Locally generated responses: the placeholder and the health-check answer.
//!
//! HTTP framing (placeholder in HTTP mode and health-check responses):
//!
//! ```text
//! HTTP/1.1 200 OK
//! Content-Type: text/plain; charset=utf-8
//! Cache-Control: no-cache
//! Connection: close
//! Content-Length: <len(body)>
//!
//! <body>
//! ```

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::release::{ignore_release_error, ReleaseSite};
use crate::config::{Placeholder, PlaceholderMode};

/// Upper bound on writing a local response.
pub const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long unread client bytes are discarded after a response.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Maximum client bytes discarded after a response.
pub const DRAIN_LIMIT: usize = 64 * 1024;

/// Frame `body` as a `200 OK` plain-text HTTP response.
pub fn http_ok(body: &str) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}

/// Wire bytes of the placeholder.
pub fn placeholder_bytes(placeholder: &Placeholder) -> Vec<u8> {
    match placeholder.mode {
        PlaceholderMode::Plain => placeholder.body.as_bytes().to_vec(),
        PlaceholderMode::Http => http_ok(&placeholder.body),
    }
}

/// Wire bytes of a matched health-check response.
pub fn health_response_bytes(body: &str) -> Vec<u8> {
    http_ok(body)
}

/// Send `payload` to the client and close the connection.
///
/// The write half is shut down first and any bytes the client already sent
/// are discarded for a short, bounded time, so the response is not lost to a
/// reset triggered by unread data. Returns whether the payload was written.
pub async fn respond_and_close(mut stream: TcpStream, payload: &[u8]) -> bool {
    let delivered = match timeout(RESPONSE_WRITE_TIMEOUT, stream.write_all(payload)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "Failed to write local response");
            false
        }
        Err(_) => {
            debug!("Timed out writing local response");
            false
        }
    };

    ignore_release_error(ReleaseSite::ClientWriteShutdown, stream.shutdown().await);
    if delivered {
        ignore_release_error(ReleaseSite::ClientDrain, drain(&mut stream).await);
    }
    delivered
}

/// Read and discard until EOF, [`DRAIN_LIMIT`] bytes, or [`DRAIN_TIMEOUT`].
async fn drain(stream: &mut TcpStream) -> std::io::Result<()> {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    let mut buf = [0u8; 4096];
    let mut discarded = 0usize;

    while discarded < DRAIN_LIMIT {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => discarded += n,
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(())
}
