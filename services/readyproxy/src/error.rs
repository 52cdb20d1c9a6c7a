//! Error types for readyproxy.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// A port mapping directive that could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// Directive is empty.
    #[error("empty port mapping")]
    Empty,

    /// Directive does not have the `LISTEN:TARGET` or `HOST:LISTEN:TARGET` shape.
    #[error("port mapping '{0}' must be LISTEN:TARGET or HOST:LISTEN:TARGET")]
    Shape(String),

    /// A port field is missing, non-numeric, or out of range.
    #[error("invalid {field} port '{value}' in mapping '{directive}'")]
    Port {
        directive: String,
        field: &'static str,
        value: String,
    },

    /// The listen host is not an IP address.
    #[error("invalid listen host '{host}' in mapping '{directive}'")]
    Host { directive: String, host: String },
}

/// A health-check header directive that could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthDirectiveError {
    /// No header name was given.
    #[error("health-check header name is empty")]
    EmptyName,

    /// Header name contains characters that cannot appear in an HTTP field name.
    #[error("health-check header name '{0}' contains invalid characters")]
    InvalidName(String),
}

/// Startup configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Every mapping directive was malformed.
    #[error("no valid port mappings configured")]
    NoValidMappings,

    /// The health-check header directive is malformed.
    #[error(transparent)]
    HealthDirective(#[from] HealthDirectiveError),

    /// An option value is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Mapping listener errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Binding the listen socket failed (port in use, permission denied, ...).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Reading the bound address back failed.
    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Backend process supervision errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No program was given.
    #[error("backend command is empty")]
    EmptyCommand,

    /// The program could not be started.
    #[error("failed to spawn backend '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Waiting on the child failed.
    #[error("failed to wait for backend: {0}")]
    Wait(#[source] io::Error),
}
