//! readyproxy configuration.
//!
//! Everything is read once at startup from the command line, with an
//! environment variable fallback for each option. Nothing here is mutated
//! after the listeners start; the proxy-wide settings are shared read-only
//! behind an `Arc`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{ConfigError, HealthDirectiveError, MappingError};
use crate::proxy::{DEFAULT_MAX_PEEK_BYTES, DEFAULT_SNIFF_TIMEOUT, MAX_PEEK_BYTES_LIMIT};

/// Default placeholder sent while the backend is not accepting connections.
pub const DEFAULT_PLACEHOLDER: &str = "service not ready\r\n";

/// Default body of a matched health-check response.
pub const DEFAULT_HEALTH_RESPONSE: &str = "ok\r\n";

/// Default liveness probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for the forwarding connection to the backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time in-flight sessions get to finish after shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One listen-port-to-backend-port forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    /// Address the listener binds to.
    pub listen_host: IpAddr,
    /// Port the listener binds to.
    pub listen_port: u16,
    /// Backend port on the target host.
    pub target_port: u16,
}

impl PortMapping {
    /// Create a new mapping.
    pub fn new(listen_host: IpAddr, listen_port: u16, target_port: u16) -> Self {
        Self {
            listen_host,
            listen_port,
            target_port,
        }
    }

    /// Parse a `LISTEN:TARGET` or `HOST:LISTEN:TARGET` directive.
    ///
    /// IPv6 hosts may be bracketed (`[::1]:6000:7000`). Directives without a
    /// host bind on `default_host`.
    pub fn parse(directive: &str, default_host: IpAddr) -> Result<Self, MappingError> {
        let directive = directive.trim();
        if directive.is_empty() {
            return Err(MappingError::Empty);
        }

        let mut parts = directive.rsplitn(3, ':');
        let target = parts.next().unwrap_or_default();
        let listen = parts
            .next()
            .ok_or_else(|| MappingError::Shape(directive.to_string()))?;
        let host = parts.next();

        let listen_port = parse_port(directive, "listen", listen)?;
        let target_port = parse_port(directive, "target", target)?;
        if target_port == 0 {
            return Err(MappingError::Port {
                directive: directive.to_string(),
                field: "target",
                value: target.to_string(),
            });
        }

        let listen_host = match host {
            None => default_host,
            Some(raw) => {
                let trimmed = raw.trim_start_matches('[').trim_end_matches(']');
                trimmed.parse().map_err(|_| MappingError::Host {
                    directive: directive.to_string(),
                    host: raw.to_string(),
                })?
            }
        };

        Ok(Self::new(listen_host, listen_port, target_port))
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.listen_port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen_addr(), self.target_port)
    }
}

fn parse_port(directive: &str, field: &'static str, value: &str) -> Result<u16, MappingError> {
    value.trim().parse().map_err(|_| MappingError::Port {
        directive: directive.to_string(),
        field,
        value: value.to_string(),
    })
}

/// Health-check interception settings.
///
/// When present, every new connection is sniffed for a request header that
/// marks it as a health check; matching requests are answered locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Header name, matched case-insensitively.
    pub header_name: String,
    /// Required substring of the header value (case-sensitive), if any.
    pub header_value: Option<String>,
    /// Body of the synthetic success response.
    pub response_body: String,
    /// How long to wait for the first request bytes.
    pub sniff_timeout: Duration,
    /// Upper bound on the bytes inspected.
    pub max_peek_bytes: usize,
}

impl HealthCheckConfig {
    /// Build a config from a `Name` or `Name=Value` directive with default
    /// response and sniff limits.
    pub fn from_directive(directive: &str) -> Result<Self, HealthDirectiveError> {
        let (name, value) = match directive.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (directive.trim(), None),
        };

        if name.is_empty() {
            return Err(HealthDirectiveError::EmptyName);
        }
        if !name.bytes().all(is_token_byte) {
            return Err(HealthDirectiveError::InvalidName(name.to_string()));
        }

        Ok(Self {
            header_name: name.to_string(),
            header_value: value.filter(|v| !v.is_empty()).map(str::to_string),
            response_body: DEFAULT_HEALTH_RESPONSE.to_string(),
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            max_peek_bytes: DEFAULT_MAX_PEEK_BYTES,
        })
    }

    /// Whether a parsed request header satisfies this config.
    pub fn matches_header(&self, name: &str, value: &str) -> bool {
        if !name.eq_ignore_ascii_case(&self.header_name) {
            return false;
        }
        match &self.header_value {
            Some(expected) => value.contains(expected.as_str()),
            None => true,
        }
    }
}

/// RFC 9110 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// How the placeholder is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderMode {
    /// Raw message bytes, no framing.
    #[default]
    Plain,
    /// Message wrapped in a `200 OK` HTTP response.
    Http,
}

/// The response sent instead of forwarding while the backend is down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub body: String,
    pub mode: PlaceholderMode,
}

impl Default for Placeholder {
    fn default() -> Self {
        Self {
            body: DEFAULT_PLACEHOLDER.to_string(),
            mode: PlaceholderMode::Plain,
        }
    }
}

/// Settings shared by every mapping listener and connection dispatcher.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host the backends listen on.
    pub target_host: IpAddr,
    /// Liveness probe timeout.
    pub probe_timeout: Duration,
    /// Timeout for the forwarding connection.
    pub connect_timeout: Duration,
    /// Response sent while the backend is unavailable.
    pub placeholder: Placeholder,
    /// Health-check interception; `None` disables sniffing entirely.
    pub health_check: Option<HealthCheckConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            target_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            placeholder: Placeholder::default(),
            health_check: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Valid mappings, in the order given.
    pub mappings: Vec<PortMapping>,
    /// Shared proxy settings.
    pub proxy: Arc<ProxyConfig>,
    /// How long in-flight sessions may drain after shutdown.
    pub shutdown_grace: Duration,
    /// Backend program and arguments to supervise (empty = none).
    pub backend_command: Vec<String>,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

/// Liveness-gated TCP proxy.
///
/// Accepts connections on each mapping's listen port and forwards them to the
/// target port once the backend accepts connections; until then clients get a
/// placeholder response.
#[derive(Debug, Parser)]
#[command(name = "readyproxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port mapping, LISTEN:TARGET or HOST:LISTEN:TARGET (repeatable).
    #[arg(short = 'm', long = "map", env = "READYPROXY_MAPPINGS", value_delimiter = ',')]
    pub maps: Vec<String>,

    /// Listen port of the single mapping used when no --map is given.
    #[arg(long, env = "LISTEN_PORT", default_value = "8081")]
    pub listen_port: String,

    /// Target port of the single mapping used when no --map is given.
    #[arg(long, env = "TARGET_PORT", default_value = "6000")]
    pub target_port: String,

    /// Bind address for mappings that do not name one.
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    /// Host the backend listens on.
    #[arg(long, env = "TARGET_HOST", default_value = "127.0.0.1")]
    pub target_host: IpAddr,

    /// Message sent while the backend is not ready.
    #[arg(long, env = "PLACEHOLDER_MESSAGE", default_value = DEFAULT_PLACEHOLDER)]
    pub placeholder: String,

    /// Wrap the placeholder in an HTTP 200 response.
    #[arg(long, env = "PLACEHOLDER_HTTP")]
    pub placeholder_http: bool,

    /// Health-check header, `Name` or `Name=Value`.
    #[arg(long, env = "HEALTH_CHECK_HEADER")]
    pub health_header: Option<String>,

    /// Body of the health-check success response.
    #[arg(long, env = "HEALTH_CHECK_RESPONSE", default_value = DEFAULT_HEALTH_RESPONSE)]
    pub health_response: String,

    /// How long to wait for request headers, in milliseconds.
    #[arg(long, env = "SNIFF_TIMEOUT_MS", default_value_t = 200)]
    pub sniff_timeout_ms: u64,

    /// Maximum bytes inspected when looking for request headers (at most 65536).
    #[arg(long, env = "MAX_PEEK_BYTES", default_value_t = DEFAULT_MAX_PEEK_BYTES)]
    pub max_peek_bytes: usize,

    /// Liveness probe timeout, in milliseconds.
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value_t = 1000)]
    pub probe_timeout_ms: u64,

    /// Backend connect timeout, in milliseconds.
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    /// Seconds in-flight sessions may drain after a shutdown signal.
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = DEFAULT_SHUTDOWN_GRACE.as_secs())]
    pub shutdown_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error) used when RUST_LOG is unset.
    #[arg(long, env = "READYPROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "READYPROXY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Backend program and its arguments, after `--`.
    #[arg(last = true, value_name = "BACKEND")]
    pub backend: Vec<String>,
}

impl Cli {
    /// Resolve the command line into a [`Config`].
    ///
    /// Malformed mappings are skipped and returned alongside the config so the
    /// caller can report them; only a config with no usable mapping at all is
    /// an error.
    pub fn into_config(self) -> Result<(Config, Vec<MappingError>), ConfigError> {
        if self.max_peek_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max-peek-bytes",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_peek_bytes > MAX_PEEK_BYTES_LIMIT {
            return Err(ConfigError::InvalidValue {
                field: "max-peek-bytes",
                reason: format!("must be at most {MAX_PEEK_BYTES_LIMIT}"),
            });
        }

        let directives = if self.maps.is_empty() {
            vec![format!("{}:{}", self.listen_port, self.target_port)]
        } else {
            self.maps
        };

        let mut mappings = Vec::new();
        let mut skipped = Vec::new();
        for directive in &directives {
            match PortMapping::parse(directive, self.listen_host) {
                Ok(mapping) => mappings.push(mapping),
                Err(e) => skipped.push(e),
            }
        }
        if mappings.is_empty() {
            return Err(ConfigError::NoValidMappings);
        }

        let health_check = self
            .health_header
            .as_deref()
            .map(HealthCheckConfig::from_directive)
            .transpose()?
            .map(|hc| HealthCheckConfig {
                response_body: self.health_response.clone(),
                sniff_timeout: Duration::from_millis(self.sniff_timeout_ms),
                max_peek_bytes: self.max_peek_bytes,
                ..hc
            });

        let proxy = ProxyConfig {
            target_host: self.target_host,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            placeholder: Placeholder {
                body: self.placeholder,
                mode: if self.placeholder_http {
                    PlaceholderMode::Http
                } else {
                    PlaceholderMode::Plain
                },
            },
            health_check,
        };

        let config = Config {
            mappings,
            proxy: Arc::new(proxy),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            backend_command: self.backend,
            log_level: self.log_level,
            log_format: self.log_format,
        };

        Ok((config, skipped))
    }
}
