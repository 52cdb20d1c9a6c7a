//! Backend liveness probing and connection.
//!
//! A probe is a throwaway TCP connect to the backend port: it answers "is the
//! backend accepting connections right now?" and is closed immediately. The
//! forwarding connection is always a separate, fresh connect.
//!
//! - probe timeout: 1s default
//! - connect timeout for the forwarding connection: 2s default

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_PROBE_TIMEOUT};

/// Probes and connects to one backend host.
#[derive(Debug, Clone)]
pub struct LivenessProber {
    /// Host the backend ports live on.
    host: IpAddr,
    /// Probe timeout.
    probe_timeout: Duration,
    /// Forwarding connect timeout.
    connect_timeout: Duration,
}

impl LivenessProber {
    /// Create a prober for `host` with default timeouts.
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Create a prober with custom timeouts.
    pub fn with_timeouts(host: IpAddr, probe_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            host,
            probe_timeout,
            connect_timeout,
        }
    }

    /// Backend address for `port`.
    pub fn target_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.host, port)
    }

    /// Whether the backend on `port` completes a TCP connect within the probe
    /// timeout. Refused, unreachable and timed-out connects all yield `false`.
    pub async fn probe(&self, port: u16) -> bool {
        let addr = self.target_addr(port);
        match timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // The probe connection is never reused for forwarding.
                drop(stream);
                trace!(target_addr = %addr, "Liveness probe succeeded");
                true
            }
            Ok(Err(e)) => {
                trace!(target_addr = %addr, error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                trace!(target_addr = %addr, "Liveness probe timed out");
                false
            }
        }
    }

    /// Open the forwarding connection to the backend on `port`.
    pub async fn connect(&self, port: u16) -> io::Result<TcpStream> {
        let addr = self.target_addr(port);
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    trace!(error = %e, "Failed to set TCP_NODELAY on backend stream");
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        }
    }
}
