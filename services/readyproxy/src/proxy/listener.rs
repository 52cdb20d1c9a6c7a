//! Mapping listeners.
//!
//! One listener owns the listening socket of one [`PortMapping`]. It accepts
//! connections until the stop signal fires and hands every connection to the
//! [`Dispatcher`] on its own task, so a stalled session never holds up the
//! accept loop.
//!
//! - bind failures are fatal to this listener only
//! - stopping closes the listening socket; in-flight sessions keep running

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, Instrument};

use super::dispatch::{BackendUnavailable, Dispatcher, SessionOutcome};
use crate::config::PortMapping;
use crate::error::ListenerError;
use crate::shutdown::StopSignal;

/// Listen backlog for mapping sockets.
pub const LISTEN_BACKLOG: u32 = 1024;

/// Pause after an accept error before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Poll interval while waiting for sessions to drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Counters for one mapping listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished.
    pub connections_closed: AtomicU64,
    /// Health-check requests answered locally.
    pub health_checks_answered: AtomicU64,
    /// Placeholder responses sent.
    pub placeholders_sent: AtomicU64,
    /// Sessions relayed to the backend.
    pub sessions_forwarded: AtomicU64,
    /// Forwarding connects that failed after a successful probe.
    pub backend_connect_failed: AtomicU64,
    /// Bytes relayed to the backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from the backend.
    pub bytes_from_backend: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub health_checks_answered: u64,
    pub placeholders_sent: u64,
    pub sessions_forwarded: u64,
    pub backend_connect_failed: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

impl ListenerStats {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            health_checks_answered: self.health_checks_answered.load(Ordering::Relaxed),
            placeholders_sent: self.placeholders_sent.load(Ordering::Relaxed),
            sessions_forwarded: self.sessions_forwarded.load(Ordering::Relaxed),
            backend_connect_failed: self.backend_connect_failed.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
        }
    }

    /// Sessions currently running.
    pub fn active(&self) -> u64 {
        self.connections_active.load(Ordering::Acquire)
    }

    /// Wait until no session is running or `deadline` passes.
    ///
    /// Returns `true` if every session finished in time.
    pub async fn wait_idle(&self, deadline: Instant) -> bool {
        loop {
            if self.active() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    fn session_started(self: &Arc<Self>) -> ActiveSession {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::AcqRel);
        ActiveSession {
            stats: Arc::clone(self),
        }
    }

    fn record_outcome(&self, outcome: &SessionOutcome) {
        match outcome {
            SessionOutcome::HealthCheck { .. } => {
                self.health_checks_answered.fetch_add(1, Ordering::Relaxed);
            }
            SessionOutcome::Forwarded {
                to_backend,
                from_backend,
            } => {
                self.sessions_forwarded.fetch_add(1, Ordering::Relaxed);
                self.bytes_to_backend
                    .fetch_add(to_backend.bytes, Ordering::Relaxed);
                self.bytes_from_backend
                    .fetch_add(from_backend.bytes, Ordering::Relaxed);
            }
            SessionOutcome::Placeholder { reason, .. } => {
                self.placeholders_sent.fetch_add(1, Ordering::Relaxed);
                if *reason == BackendUnavailable::ConnectFailed {
                    self.backend_connect_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Holds one slot of `connections_active` for a running session.
///
/// Released on drop, so a session task that panics or is cancelled still
/// counts as closed.
#[derive(Debug)]
struct ActiveSession {
    stats: Arc<ListenerStats>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accept loop for one port mapping.
pub struct MappingListener {
    /// The mapping served.
    mapping: PortMapping,
    /// The bound socket.
    listener: TcpListener,
    /// Per-connection decision logic.
    dispatcher: Dispatcher,
    /// Stop flag.
    stop: StopSignal,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl MappingListener {
    /// Bind the listen socket for `mapping` (with address reuse enabled).
    pub async fn bind(
        mapping: PortMapping,
        dispatcher: Dispatcher,
        stop: StopSignal,
    ) -> Result<Self, ListenerError> {
        let addr = mapping.listen_addr();
        let listener = bind_reusable(addr).map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            target_port = mapping.target_port,
            "Listener bound"
        );

        Ok(Self {
            mapping,
            listener,
            dispatcher,
            stop,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle on the listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until the stop signal fires.
    ///
    /// The listening socket is closed on return; sessions already dispatched
    /// keep running.
    pub async fn run(mut self) {
        let bind_addr = self.mapping.listen_addr();
        info!(
            bind_addr = %bind_addr,
            target_port = self.mapping.target_port,
            "Listener started"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop.stopped() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let active = self.stats.session_started();
                    let dispatcher = self.dispatcher.clone();
                    let mapping = self.mapping;

                    tokio::spawn(
                        async move {
                            let outcome = dispatcher.dispatch(stream, mapping).await;
                            debug!(outcome = ?outcome, "Connection closed");
                            active.stats.record_outcome(&outcome);
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            peer = %peer_addr,
                            listen_port = mapping.listen_port,
                            target_port = mapping.target_port,
                        )),
                    );
                }
                Err(e) => {
                    error!(bind_addr = %bind_addr, error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            bind_addr = %bind_addr,
            accepted = stats.connections_accepted,
            active = stats.connections_active,
            forwarded = stats.sessions_forwarded,
            placeholders = stats.placeholders_sent,
            health_checks = stats.health_checks_answered,
            "Listener stopped"
        );
    }
}

fn bind_reusable(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}
