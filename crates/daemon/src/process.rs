//! Subprocess driver with graceful-then-forced shutdown.
//!
//! Each supervised child is owned by one driver task that waits for exit and
//! applies termination requests. Callers hold a cheap [`ProcessHandle`] to
//! signal the child and await its exit outcome.

use serde::Serialize;
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Time a child gets to exit after the graceful signal before it is killed
pub const STOP_GRACE: Duration = Duration::from_secs(3);

/// Termination requests understood by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// SIGTERM on unix, hard kill elsewhere
    Terminate,
    /// SIGKILL
    Kill,
}

/// How a supervised child ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the exit status could not be collected
    pub error: Option<String>,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            error: None,
        }
    }

    fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Exit code zero
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable description, e.g. `ffmpeg exited with code 1`
    pub fn describe(&self, name: &str) -> String {
        match (self.code, self.signal, &self.error) {
            (_, _, Some(error)) => format!("{} exit status unavailable: {}", name, error),
            (Some(code), _, _) => format!("{} exited with code {}", name, code),
            (None, Some(signal), _) => format!("{} terminated by signal {}", name, signal),
            (None, None, None) => format!("{} exited", name),
        }
    }
}

/// Which phase of the shutdown protocol ended the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Exited within the grace period
    Graceful,
    /// Needed the forceful kill
    Forced,
}

/// Handle to a driven child process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    control: mpsc::Sender<Control>,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check if the driver has published an exit outcome
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Send a termination request; a no-op once the child has exited
    pub async fn signal(&self, control: Control) {
        if self.control.send(control).await.is_err() {
            debug!(pid = self.pid, ?control, "driver already finished");
        }
    }

    /// Wait until the driver has run its exit hook and published the outcome
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| ExitOutcome::failed("process driver stopped"))
    }

    /// Terminate gracefully, escalating to a kill after `grace`
    ///
    /// Always waits for the exit outcome before returning. A child that
    /// exits inside the grace period is never sent the kill.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownKind {
        if self.has_exited() {
            return ShutdownKind::Graceful;
        }

        self.signal(Control::Terminate).await;
        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return ShutdownKind::Graceful;
        }

        warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "graceful stop timed out, killing");
        self.signal(Control::Kill).await;
        self.wait().await;
        ShutdownKind::Forced
    }
}

/// Take ownership of `child` and drive it until exit
///
/// `on_exit` runs on the driver task after the child is reaped and before
/// the outcome becomes visible to [`ProcessHandle::wait`].
pub fn drive<F, Fut>(mut child: Child, on_exit: F) -> ProcessHandle
where
    F: FnOnce(ExitOutcome) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let pid = child.id().unwrap_or(0);
    let (control_tx, mut control_rx) = mpsc::channel::<Control>(4);
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut control_open = true;
        let outcome = loop {
            let request = tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => ExitOutcome::from_status(status),
                        Err(e) => ExitOutcome::failed(e),
                    };
                }
                request = control_rx.recv(), if control_open => request,
            };

            match request {
                Some(Control::Terminate) => terminate(&mut child, pid),
                Some(Control::Kill) => {
                    if let Err(e) = child.start_kill() {
                        debug!(pid, error = %e, "kill failed");
                    }
                }
                None => control_open = false,
            }
        };

        debug!(pid, code = ?outcome.code, signal = ?outcome.signal, "child exited");
        on_exit(outcome.clone()).await;
        let _ = exit_tx.send(Some(outcome));
    });

    ProcessHandle {
        pid,
        control: control_tx,
        exit: exit_rx,
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // pid 0 would address our own process group
    if pid != 0 {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid, "sent SIGTERM");
                return;
            }
            Err(e) => warn!(pid, error = %e, "SIGTERM failed, killing"),
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "kill failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, pid: u32) {
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "kill failed");
    }
}
