//! HTTP request header sniffing for health-check interception.
//!
//! This module looks at the first bytes of a new connection without
//! consuming them. The bytes stay in the socket receive buffer, so whatever
//! reads the stream next (the forwarding pump, or nobody) sees it untouched.
//!
//! - sniff_timeout: 200ms default
//! - max_peek_bytes: 8192 bytes default, 64 KiB at most
//!
//! Only the header block of the first request is inspected. Bodies, chunked
//! encoding and pipelined requests are never looked at.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace};

use crate::config::HealthCheckConfig;

/// Default timeout for the first request bytes to arrive.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(200);

/// Default maximum bytes inspected.
pub const DEFAULT_MAX_PEEK_BYTES: usize = 8192;

/// Upper bound on bytes inspected, whatever the configuration says.
pub const MAX_PEEK_BYTES_LIMIT: usize = 64 * 1024;

/// Pause between peeks while a header block is still arriving.
const REPEEK_INTERVAL: Duration = Duration::from_millis(10);

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A parsed `name: value` request header.
pub type Header = (String, String);

/// Result of header sniffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// A complete header block was found (request line excluded).
    Headers(Vec<Header>),
    /// No data arrived within the timeout.
    Timeout,
    /// Data arrived but no header terminator within the byte or time bound.
    Incomplete,
    /// Peer closed before sending a header block.
    Closed,
    /// I/O error while waiting or peeking.
    IoError(String),
}

impl SniffResult {
    /// The parsed headers, if a complete block was found.
    pub fn headers(&self) -> Option<&[Header]> {
        match self {
            SniffResult::Headers(headers) => Some(headers),
            _ => None,
        }
    }
}

/// Non-consuming header inspector.
#[derive(Debug, Clone)]
pub struct HeaderSniffer {
    timeout: Duration,
    max_bytes: usize,
}

impl HeaderSniffer {
    /// Create a sniffer with explicit bounds.
    ///
    /// `max_bytes` is clamped to [`MAX_PEEK_BYTES_LIMIT`]; the peek buffer is
    /// allocated per connection.
    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        Self {
            timeout,
            max_bytes: max_bytes.clamp(HEADER_TERMINATOR.len(), MAX_PEEK_BYTES_LIMIT),
        }
    }

    /// Create a sniffer using the bounds of a health-check config.
    pub fn from_config(config: &HealthCheckConfig) -> Self {
        Self::new(config.sniff_timeout, config.max_peek_bytes)
    }

    /// Peek at the start of `stream` for a complete request header block.
    ///
    /// Never reads from the stream: every inspection is a `MSG_PEEK`.
    pub async fn inspect(&self, stream: &TcpStream) -> SniffResult {
        let deadline = Instant::now() + self.timeout;

        match timeout_at(deadline, stream.readable()).await {
            Err(_) => return SniffResult::Timeout,
            Ok(Err(e)) => return SniffResult::IoError(e.to_string()),
            Ok(Ok(())) => {}
        }

        let mut buf = vec![0u8; self.max_bytes];
        loop {
            let n = match timeout_at(deadline, stream.peek(&mut buf)).await {
                Err(_) => return SniffResult::Incomplete,
                Ok(Err(e)) => return SniffResult::IoError(e.to_string()),
                Ok(Ok(n)) => n,
            };

            if n == 0 {
                return SniffResult::Closed;
            }

            if let Some(end) = find_header_terminator(&buf[..n]) {
                let headers = parse_header_block(&buf[..end]);
                trace!(peeked = n, header_count = headers.len(), "Header block found");
                return SniffResult::Headers(headers);
            }

            if n >= self.max_bytes {
                debug!(max_bytes = self.max_bytes, "No header terminator within peek bound");
                return SniffResult::Incomplete;
            }

            // More of the header block may still be in flight.
            if Instant::now() + REPEEK_INTERVAL >= deadline {
                return SniffResult::Incomplete;
            }
            sleep(REPEEK_INTERVAL).await;
        }
    }
}

/// Sniff `stream` and return its request headers, if a complete block is
/// available within `timeout` and `max_bytes`.
pub async fn sniff(stream: &TcpStream, timeout: Duration, max_bytes: usize) -> Option<Vec<Header>> {
    match HeaderSniffer::new(timeout, max_bytes).inspect(stream).await {
        SniffResult::Headers(headers) => Some(headers),
        _ => None,
    }
}

/// Whether any header satisfies the health-check config.
pub fn is_health_check(config: &HealthCheckConfig, headers: &[Header]) -> bool {
    headers
        .iter()
        .any(|(name, value)| config.matches_header(name, value))
}

/// Offset of the blank line ending the header block, if present.
///
/// The returned index points at the start of `\r\n\r\n`.
pub fn find_header_terminator(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Parse a header block (without its terminator) as ISO-8859-1 text.
///
/// The first line is the request line and is skipped. Lines without a colon
/// are ignored.
pub fn parse_header_block(block: &[u8]) -> Vec<Header> {
    // ISO-8859-1 maps every byte to the code point of the same value.
    let text: String = block.iter().map(|&b| char::from(b)).collect();

    text.split('\n')
        .skip(1)
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn test_parse_header_block() {
        let block = b"GET / HTTP/1.1\r\nHost: example.com\r\nX-Health-Check:  1 \r\nnot a header";
        let headers = parse_header_block(block);
        assert_eq!(
            headers,
            vec![
                ("Host".to_string(), "example.com".to_string()),
                ("X-Health-Check".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_header_block_latin1() {
        let block = b"GET / HTTP/1.1\r\nX-Name: caf\xe9";
        let headers = parse_header_block(block);
        assert_eq!(headers[0].1, "caf\u{e9}");
    }

    #[test]
    fn test_parse_skips_request_line() {
        let headers = parse_header_block(b"X-Health-Check: 1");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_find_header_terminator() {
        assert_eq!(find_header_terminator(b"GET / HTTP/1.1\r\n\r\n"), Some(14));
        assert_eq!(find_header_terminator(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_header_terminator(b""), None);
    }

    #[test]
    fn test_is_health_check() {
        let config = HealthCheckConfig::from_directive("X-Health-Check=staging").unwrap();
        let matching = parse_header_block(b"GET / HTTP/1.1\r\nx-health-check: staging");
        let wrong_value = parse_header_block(b"GET / HTTP/1.1\r\nX-Health-Check: prod");
        assert!(is_health_check(&config, &matching));
        assert!(!is_health_check(&config, &wrong_value));
    }

    #[tokio::test]
    async fn test_sniff_does_not_consume() {
        let (mut client, mut server) = connected_pair().await;
        let request = b"GET / HTTP/1.1\r\nX-Health-Check: 1\r\n\r\nbody";
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let headers = sniff(&server, Duration::from_millis(500), 8192).await.unwrap();
        assert_eq!(headers, vec![("X-Health-Check".to_string(), "1".to_string())]);

        let mut seen = Vec::new();
        server.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, request);
    }

    #[tokio::test]
    async fn test_sniff_timeout_without_data() {
        let (_client, server) = connected_pair().await;
        let sniffer = HeaderSniffer::new(Duration::from_millis(50), 8192);
        assert_eq!(sniffer.inspect(&server).await, SniffResult::Timeout);
    }

    #[tokio::test]
    async fn test_sniff_incomplete_within_max_bytes() {
        let (mut client, mut server) = connected_pair().await;
        let request = b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let sniffer = HeaderSniffer::new(Duration::from_millis(500), 32);
        // Give the whole request time to land so a single peek fills the bound.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sniffer.inspect(&server).await, SniffResult::Incomplete);

        let mut seen = Vec::new();
        server.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, request);
    }

    #[tokio::test]
    async fn test_sniff_non_http_is_incomplete() {
        let (mut client, server) = connected_pair().await;
        client.write_all(b"\x16\x03\x01\x00\x05hello").await.unwrap();

        let sniffer = HeaderSniffer::new(Duration::from_millis(60), 8192);
        assert_eq!(sniffer.inspect(&server).await, SniffResult::Incomplete);
    }

    #[tokio::test]
    async fn test_sniff_header_block_split_across_writes() {
        let (mut client, server) = connected_pair().await;
        client.write_all(b"GET / HTTP/1.1\r\nX-Health").await.unwrap();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            client.write_all(b"-Check: 1\r\n\r\n").await.unwrap();
            client
        });

        let sniffer = HeaderSniffer::new(Duration::from_millis(500), 8192);
        let result = sniffer.inspect(&server).await;
        let _client = writer.await.unwrap();
        assert_eq!(
            result.headers(),
            Some(&[("X-Health-Check".to_string(), "1".to_string())][..])
        );
    }

    #[tokio::test]
    async fn test_oversized_peek_bound_is_clamped() {
        let sniffer = HeaderSniffer::new(Duration::from_millis(500), usize::MAX);
        assert_eq!(sniffer.max_bytes, MAX_PEEK_BYTES_LIMIT);

        let (mut client, server) = connected_pair().await;
        client
            .write_all(b"GET / HTTP/1.1\r\nX-Health-Check: 1\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(
            sniffer.inspect(&server).await.headers(),
            Some(&[("X-Health-Check".to_string(), "1".to_string())][..])
        );
    }

    #[tokio::test]
    async fn test_sniff_closed_before_data() {
        let (client, server) = connected_pair().await;
        drop(client);
        let sniffer = HeaderSniffer::new(Duration::from_millis(500), 8192);
        assert_eq!(sniffer.inspect(&server).await, SniffResult::Closed);
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let headers = parse_header_block(&data);
            for (name, _) in headers {
                prop_assert!(!name.is_empty());
            }
        }

        #[test]
        fn prop_terminator_offset_is_exact(prefix in "[a-zA-Z: ]{0,64}") {
            let mut data = prefix.clone().into_bytes();
            data.extend_from_slice(b"\r\n\r\n");
            prop_assert_eq!(find_header_terminator(&data), Some(prefix.len()));
        }
    }
}
