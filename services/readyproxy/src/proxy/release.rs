//! Best-effort resource release.
//!
//! Every teardown step on a proxied socket can fail once the peer has gone
//! away (reset, broken pipe, not connected). Those failures carry no useful
//! information for the session, so each release site reports through
//! [`ignore_release_error`] instead of propagating.

use std::fmt;
use std::io;

use tracing::trace;

/// A place where a socket is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseSite {
    /// Pump forwarding end-of-stream as a write shutdown on its destination.
    DestinationWriteShutdown,
    /// Pump shutting down the read half of its own source on exit.
    SourceReadShutdown,
    /// Response path shutting down the client write half after the response.
    ClientWriteShutdown,
    /// Response path discarding unread client bytes before closing.
    ClientDrain,
}

impl fmt::Display for ReleaseSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReleaseSite::DestinationWriteShutdown => "destination write shutdown",
            ReleaseSite::SourceReadShutdown => "source read shutdown",
            ReleaseSite::ClientWriteShutdown => "client write shutdown",
            ReleaseSite::ClientDrain => "client drain",
        };
        f.write_str(name)
    }
}

/// Record and discard the error of a release step.
pub fn ignore_release_error(site: ReleaseSite, result: io::Result<()>) {
    if let Err(e) = result {
        trace!(site = %site, error = %e, "Ignoring release error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_release_error_accepts_both() {
        ignore_release_error(ReleaseSite::ClientDrain, Ok(()));
        ignore_release_error(
            ReleaseSite::SourceReadShutdown,
            Err(io::Error::from(io::ErrorKind::NotConnected)),
        );
    }

    #[test]
    fn test_release_site_display() {
        assert_eq!(
            ReleaseSite::DestinationWriteShutdown.to_string(),
            "destination write shutdown"
        );
    }
}
