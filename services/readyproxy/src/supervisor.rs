//! Wrapped backend process supervision.
//!
//! The proxy can launch the backend it fronts. The child is started before
//! any listener binds, so clients get the placeholder while it boots. It
//! inherits stdio and is stopped with SIGTERM, then killed once the grace
//! period runs out.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::shutdown::StopSignal;

/// A running backend child process.
#[derive(Debug)]
pub struct BackendProcess {
    program: String,
    child: Child,
}

impl BackendProcess {
    /// Start `command` (program followed by its arguments).
    pub fn spawn(command: &[String]) -> Result<Self, SupervisorError> {
        let (program, args) = command.split_first().ok_or(SupervisorError::EmptyCommand)?;

        info!(program = %program, args = ?args, "Starting backend");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.clone(),
                source,
            })?;

        info!(program = %program, pid = ?child.id(), "Backend started");

        Ok(Self {
            program: program.clone(),
            child,
        })
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, SupervisorError> {
        self.child.wait().await.map_err(SupervisorError::Wait)
    }

    /// Ask the child to stop, escalating to a kill after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus, SupervisorError> {
        if let Some(status) = self.child.try_wait().map_err(SupervisorError::Wait)? {
            return Ok(status);
        }

        self.send_sigterm();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map_err(SupervisorError::Wait),
            Err(_) => {
                warn!(program = %self.program, "Backend ignored SIGTERM, killing");
                if let Err(e) = self.child.start_kill() {
                    debug!(error = %e, "Failed to kill backend");
                }
                self.wait().await
            }
        }
    }

    /// Supervise until the child exits or `stop` fires.
    ///
    /// An unexpected exit is logged and the proxy keeps serving placeholders.
    /// On stop the child is terminated with `grace`.
    pub async fn supervise(mut self, mut stop: StopSignal, grace: Duration) {
        let exited = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = stop.stopped() => None,
        };

        match exited {
            Some(Ok(status)) => {
                warn!(program = %self.program, status = %status, "Backend exited");
            }
            Some(Err(e)) => {
                warn!(program = %self.program, error = %e, "Failed to wait for backend");
            }
            None => match self.terminate(grace).await {
                Ok(status) => info!(program = %self.program, status = %status, "Backend stopped"),
                Err(e) => warn!(program = %self.program, error = %e, "Failed to stop backend"),
            },
        }
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, error = %e, "Failed to send SIGTERM to backend");
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    fn command(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            BackendProcess::spawn(&[]),
            Err(SupervisorError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = BackendProcess::spawn(&command(&["/nonexistent/readyproxy-backend"]));
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_wait_reports_exit_status() {
        let mut backend = BackendProcess::spawn(&command(&["true"])).unwrap();
        let status = backend.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_terminate_stops_sleeping_child() {
        let mut backend = BackendProcess::spawn(&command(&["sleep", "30"])).unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            backend.terminate(Duration::from_secs(2)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut backend =
            BackendProcess::spawn(&command(&["sh", "-c", "trap '' TERM; sleep 30"])).unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            backend.terminate(Duration::from_millis(100)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_supervise_terminates_on_stop() {
        let coordinator = ShutdownCoordinator::new();
        let backend = BackendProcess::spawn(&command(&["sleep", "30"])).unwrap();
        let task = tokio::spawn(backend.supervise(coordinator.signal(), Duration::from_secs(2)));

        coordinator.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
