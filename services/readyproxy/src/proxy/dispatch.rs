//! Per-connection dispatch.
//!
//! Each accepted connection becomes a [`ProxySession`] that walks:
//!
//! ```text
//! START -> SNIFFING -> HEALTH_RESPONSE -> CLOSED
//!              |
//!              v
//!        LIVENESS_CHECK -> FORWARDING -> CLOSED
//!              |
//!              v
//!      PLACEHOLDER_RESPONSE -> CLOSED
//! ```
//!
//! SNIFFING is skipped when no health check is configured. The forwarding
//! connection is only opened right after a successful probe; if it still
//! fails, the client gets the placeholder.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::probe::LivenessProber;
use super::pump::{forward, PumpOutcome};
use super::response::{health_response_bytes, placeholder_bytes, respond_and_close};
use super::sniff::{is_health_check, HeaderSniffer};
use crate::config::{HealthCheckConfig, PortMapping, ProxyConfig};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    Sniffing,
    HealthResponse,
    LivenessCheck,
    Forwarding,
    PlaceholderResponse,
    Closed,
}

/// Why the backend was not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendUnavailable {
    /// The liveness probe failed.
    ProbeFailed,
    /// The probe passed but the forwarding connect failed.
    ConnectFailed,
}

/// Terminal result of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A health-check request was answered locally.
    HealthCheck { delivered: bool },
    /// The session was relayed to the backend.
    Forwarded {
        to_backend: PumpOutcome,
        from_backend: PumpOutcome,
    },
    /// The placeholder was sent instead of forwarding.
    ///
    /// `delivered` is informational only; the client is closed either way.
    Placeholder {
        reason: BackendUnavailable,
        delivered: bool,
    },
}

/// State of one accepted connection. Owned by the dispatch call handling it.
#[derive(Debug)]
pub struct ProxySession {
    client: TcpStream,
    mapping: PortMapping,
    state: SessionState,
}

impl ProxySession {
    fn new(client: TcpStream, mapping: PortMapping) -> Self {
        Self {
            client,
            mapping,
            state: SessionState::Start,
        }
    }

    fn enter(&mut self, next: SessionState) {
        trace!(from = ?self.state, to = ?next, mapping = %self.mapping, "Session transition");
        self.state = next;
    }

    /// Send a local response; closes the client on this path.
    async fn respond(self, payload: &[u8]) -> bool {
        let delivered = respond_and_close(self.client, payload).await;
        trace!(from = ?self.state, to = ?SessionState::Closed, "Session transition");
        delivered
    }

    /// Relay to `backend`; the pumps close both sockets.
    async fn relay(mut self, backend: TcpStream) -> (PumpOutcome, PumpOutcome) {
        self.enter(SessionState::Forwarding);
        let outcome = forward(self.client, backend).await;
        trace!(from = ?self.state, to = ?SessionState::Closed, "Session transition");
        outcome
    }
}

/// Decides what happens to each accepted connection.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: Arc<ProxyConfig>,
    prober: LivenessProber,
    sniffer: Option<HeaderSniffer>,
    placeholder: Arc<[u8]>,
    health_response: Arc<[u8]>,
}

impl Dispatcher {
    /// Build a dispatcher from shared proxy settings.
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        let prober = LivenessProber::with_timeouts(
            config.target_host,
            config.probe_timeout,
            config.connect_timeout,
        );
        let sniffer = config.health_check.as_ref().map(HeaderSniffer::from_config);
        let placeholder = placeholder_bytes(&config.placeholder).into();
        let health_response = config
            .health_check
            .as_ref()
            .map(|hc| health_response_bytes(&hc.response_body))
            .unwrap_or_default()
            .into();

        Self {
            config,
            prober,
            sniffer,
            placeholder,
            health_response,
        }
    }

    /// Handle one accepted connection to completion.
    pub async fn dispatch(&self, client: TcpStream, mapping: PortMapping) -> SessionOutcome {
        let mut session = ProxySession::new(client, mapping);

        if let (Some(sniffer), Some(health_check)) = (&self.sniffer, &self.config.health_check) {
            session.enter(SessionState::Sniffing);
            if self.is_health_request(sniffer, health_check, &session.client).await {
                session.enter(SessionState::HealthResponse);
                debug!(mapping = %mapping, "Answering health check");
                let delivered = session.respond(&self.health_response).await;
                return SessionOutcome::HealthCheck { delivered };
            }
        }

        session.enter(SessionState::LivenessCheck);
        if !self.prober.probe(mapping.target_port).await {
            debug!(target_port = mapping.target_port, "Backend not ready");
            return self
                .send_placeholder(session, BackendUnavailable::ProbeFailed)
                .await;
        }

        match self.prober.connect(mapping.target_port).await {
            Ok(backend) => {
                let (to_backend, from_backend) = session.relay(backend).await;
                SessionOutcome::Forwarded {
                    to_backend,
                    from_backend,
                }
            }
            Err(e) => {
                debug!(
                    target_port = mapping.target_port,
                    error = %e,
                    "Backend connect failed after successful probe"
                );
                self.send_placeholder(session, BackendUnavailable::ConnectFailed)
                    .await
            }
        }
    }

    async fn is_health_request(
        &self,
        sniffer: &HeaderSniffer,
        health_check: &HealthCheckConfig,
        client: &TcpStream,
    ) -> bool {
        let result = sniffer.inspect(client).await;
        trace!(result = ?result, "Sniff finished");
        result
            .headers()
            .is_some_and(|headers| is_health_check(health_check, headers))
    }

    async fn send_placeholder(
        &self,
        mut session: ProxySession,
        reason: BackendUnavailable,
    ) -> SessionOutcome {
        session.enter(SessionState::PlaceholderResponse);
        let delivered = session.respond(&self.placeholder).await;
        SessionOutcome::Placeholder { reason, delivered }
    }
}
