//! One-shot shutdown coordination.
//!
//! The coordinator owns a stop flag that is set at most once and never
//! cleared. Every mapping listener receives a [`StopSignal`] at
//! construction and stops accepting once it fires; sessions already in
//! flight are left to finish on their own.

use std::io;

use tokio::sync::watch;
use tracing::info;

/// Owner of the process-wide stop flag.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the flag unset.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A read-only handle on the stop flag.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Set the stop flag. Returns `true` only for the call that set it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    /// Whether the stop flag is set.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait for SIGINT or SIGTERM, then set the stop flag.
    pub async fn run_signal_handler(&self) -> io::Result<()> {
        let signal = wait_for_termination().await?;
        info!(signal, "Received termination signal");
        self.trigger();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the stop flag.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stop is requested.
    ///
    /// If the coordinator is dropped without ever triggering, this never
    /// resolves.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trigger_is_one_shot() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_triggered());
        assert!(coordinator.trigger());
        assert!(!coordinator.trigger());
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_observes_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let mut early = coordinator.signal();
        assert!(!early.is_stopped());

        coordinator.trigger();
        tokio::time::timeout(Duration::from_millis(100), early.stopped())
            .await
            .unwrap();

        // Handles created after the trigger see it too.
        let mut late = coordinator.signal();
        assert!(late.is_stopped());
        tokio::time::timeout(Duration::from_millis(100), late.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_coordinator_never_stops() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.signal();
        drop(coordinator);

        let waited = tokio::time::timeout(Duration::from_millis(50), signal.stopped()).await;
        assert!(waited.is_err());
        assert!(!signal.is_stopped());
    }
}
