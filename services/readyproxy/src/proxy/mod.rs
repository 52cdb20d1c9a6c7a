//! Liveness-gated TCP forwarding.
//!
//! This module provides:
//! - Mapping listeners (one per listen address)
//! - Health-check header sniffing
//! - Backend liveness probing
//! - Placeholder and health-check responses
//! - Bidirectional relaying with half-close
//!
//! ## Architecture
//!
//! ```text
//! Client -> MappingListener -> Dispatcher -> HeaderSniffer -> health response
//!                                  |
//!                           LivenessProber -> forward (pumps) -> Backend
//!                                  |
//!                             placeholder
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use readyproxy::proxy::{Dispatcher, MappingListener};
//!
//! let coordinator = ShutdownCoordinator::new();
//! let dispatcher = Dispatcher::new(Arc::new(ProxyConfig::default()));
//! let mapping = PortMapping::parse("8080:3000", default_host)?;
//! let listener = MappingListener::bind(mapping, dispatcher, coordinator.signal()).await?;
//! tokio::spawn(listener.run());
//! ```

mod dispatch;
mod listener;
mod probe;
mod pump;
mod release;
mod response;
mod sniff;

pub use dispatch::{BackendUnavailable, Dispatcher, ProxySession, SessionOutcome, SessionState};
pub use listener::{ListenerStats, ListenerStatsSnapshot, MappingListener, LISTEN_BACKLOG};
pub use probe::LivenessProber;
pub use pump::{forward, pump, Direction, PumpEnd, PumpOutcome, PUMP_CHUNK_SIZE};
pub use release::{ignore_release_error, ReleaseSite};
pub use response::{
    health_response_bytes, http_ok, placeholder_bytes, respond_and_close, DRAIN_LIMIT,
    DRAIN_TIMEOUT, RESPONSE_WRITE_TIMEOUT,
};
pub use sniff::{
    find_header_terminator, is_health_check, parse_header_block, sniff, Header, HeaderSniffer,
    SniffResult, DEFAULT_MAX_PEEK_BYTES, DEFAULT_SNIFF_TIMEOUT, MAX_PEEK_BYTES_LIMIT,
};
