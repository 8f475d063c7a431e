//! Relay server supervision.
//!
//! Renders the MediaMTX configuration from the current settings, runs the
//! relay binary, and applies the same graceful-then-forced stop protocol as
//! task processes.

use crate::binaries::{check_executable, BinaryError, BinaryResolver};
use crate::events::{EventBus, LogOrigin};
use crate::logs::spawn_line_pump;
use crate::process::{self, ExitOutcome, ProcessHandle, STOP_GRACE};
use relaycast_config::AppSettings;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// File name of the rendered relay configuration inside the runtime dir
pub const RELAY_CONFIG_FILE: &str = "mediamtx.yml";

const RELAY_NAME: &str = "mediamtx";

/// Error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    BinaryNotFound(#[from] BinaryError),

    #[error("failed to write relay config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to render relay config: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// Relay lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct RtspServerStatus {
    pub state: ServerState,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
}

impl RtspServerStatus {
    fn new(state: ServerState, pid: Option<u32>, last_error: Option<String>) -> Self {
        Self {
            state,
            pid,
            last_error,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayConfigDoc {
    log_level: &'static str,
    rtsp: bool,
    rtsp_address: String,
    rtsp_transports: Vec<&'static str>,
    encryption: &'static str,
    rtmp: bool,
    hls: bool,
    webrtc: bool,
    srt: bool,
    auth_method: &'static str,
    auth_internal_users: Vec<RelayUser>,
    paths: BTreeMap<&'static str, PathRule>,
}

#[derive(Debug, Serialize)]
struct RelayUser {
    user: String,
    pass: String,
    ips: Vec<String>,
    permissions: Vec<Permission>,
}

#[derive(Debug, Serialize)]
struct Permission {
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct PathRule {
    source: &'static str,
}

/// Render the relay configuration for `settings`
///
/// With auth enabled only the configured user may publish and read;
/// otherwise the `any` user gets both permissions.
pub fn render_config(settings: &AppSettings) -> Result<String, serde_yaml::Error> {
    let (user, pass) = if settings.auth_enabled {
        (settings.username.clone(), settings.password.clone())
    } else {
        ("any".to_string(), String::new())
    };

    let doc = RelayConfigDoc {
        log_level: "info",
        rtsp: true,
        rtsp_address: bind_address(&settings.host, settings.port),
        rtsp_transports: vec!["tcp", "udp"],
        encryption: "no",
        rtmp: false,
        hls: false,
        webrtc: false,
        srt: false,
        auth_method: "internal",
        auth_internal_users: vec![RelayUser {
            user,
            pass,
            ips: Vec::new(),
            permissions: vec![
                Permission { action: "publish" },
                Permission { action: "read" },
            ],
        }],
        paths: BTreeMap::from([("all_others", PathRule { source: "publisher" })]),
    };

    serde_yaml::to_string(&doc)
}

fn bind_address(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

struct LiveRelay {
    handle: ProcessHandle,
    stop_requested: Arc<AtomicBool>,
}

/// Owns the single relay subprocess
pub struct RelaySupervisor {
    binaries: Arc<dyn BinaryResolver>,
    runtime_dir: PathBuf,
    events: EventBus,
    status: Arc<RwLock<RtspServerStatus>>,
    live: Mutex<Option<LiveRelay>>,
    stop_grace: Duration,
}

impl RelaySupervisor {
    pub fn new(binaries: Arc<dyn BinaryResolver>, runtime_dir: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            binaries,
            runtime_dir: runtime_dir.into(),
            events,
            status: Arc::new(RwLock::new(RtspServerStatus::default())),
            live: Mutex::new(None),
            stop_grace: STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Path the configuration is written to before each launch
    pub fn config_path(&self) -> PathBuf {
        self.runtime_dir.join(RELAY_CONFIG_FILE)
    }

    pub async fn status(&self) -> RtspServerStatus {
        self.status.read().await.clone()
    }

    /// Start the relay; a no-op while it is already starting or running
    pub async fn start(&self, settings: &AppSettings) -> Result<RtspServerStatus, RelayError> {
        let mut live = self.live.lock().await;
        self.start_locked(&mut live, settings).await
    }

    /// Stop the relay, escalating to a kill after the grace period
    pub async fn stop(&self) -> RtspServerStatus {
        let mut live = self.live.lock().await;
        self.stop_locked(&mut live).await
    }

    /// Stop then start with new settings
    pub async fn restart(&self, settings: &AppSettings) -> Result<RtspServerStatus, RelayError> {
        let mut live = self.live.lock().await;
        self.stop_locked(&mut live).await;
        self.start_locked(&mut live, settings).await
    }

    /// Whether a relay process is currently held
    pub async fn is_serving(&self) -> bool {
        self.live
            .lock()
            .await
            .as_ref()
            .is_some_and(|relay| !relay.handle.has_exited())
    }

    async fn start_locked(
        &self,
        live: &mut Option<LiveRelay>,
        settings: &AppSettings,
    ) -> Result<RtspServerStatus, RelayError> {
        if let Some(relay) = live.as_ref() {
            if !relay.handle.has_exited() {
                return Ok(self.status().await);
            }
        }
        *live = None;

        let binary = self.binaries.relay();
        self.binaries.ensure_executable(&binary);
        if let Err(e) = check_executable(&binary) {
            self.set_status(RtspServerStatus::new(ServerState::Error, None, Some(e.to_string())))
                .await;
            return Err(e.into());
        }

        let config_path = self.config_path();
        if let Err(e) = self.write_config(&config_path, settings).await {
            self.set_status(RtspServerStatus::new(ServerState::Error, None, Some(e.to_string())))
                .await;
            return Err(e);
        }

        self.set_status(RtspServerStatus::new(ServerState::Starting, None, None))
            .await;

        let spawned = Command::new(&binary)
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to launch {}: {}", RELAY_NAME, e);
                warn!(binary = %binary.display(), error = %e, "relay launch failed");
                self.events.server_log(LogOrigin::Supervisor, message.clone());
                return Ok(self
                    .set_status(RtspServerStatus::new(ServerState::Error, None, Some(message)))
                    .await);
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            spawn_line_pump(stdout, LogOrigin::Stdout, &[], move |origin, line| {
                events.server_log(origin, line)
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let events = self.events.clone();
            spawn_line_pump(stderr, LogOrigin::Stderr, &[], move |origin, line| {
                events.server_log(origin, line)
            });
        }

        let pid = child.id();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let status = self
            .set_status(RtspServerStatus::new(ServerState::Running, pid, None))
            .await;

        let hook = RelayExit {
            status: self.status.clone(),
            events: self.events.clone(),
            stop_requested: stop_requested.clone(),
        };
        let handle = process::drive(child, move |outcome| hook.run(outcome));

        let address = bind_address(&settings.host, settings.port);
        info!(pid = ?pid, address = %address, "relay started");
        self.events.server_log(
            LogOrigin::Supervisor,
            format!("{} listening on rtsp://{}", RELAY_NAME, address),
        );

        *live = Some(LiveRelay {
            handle,
            stop_requested,
        });
        Ok(status)
    }

    async fn stop_locked(&self, live: &mut Option<LiveRelay>) -> RtspServerStatus {
        let Some(relay) = live.take().filter(|relay| !relay.handle.has_exited()) else {
            let current = self.status().await;
            if current.state == ServerState::Stopped {
                return current;
            }
            return self
                .set_status(RtspServerStatus::new(ServerState::Stopped, None, None))
                .await;
        };

        relay.stop_requested.store(true, Ordering::SeqCst);
        let kind = relay.handle.shutdown(self.stop_grace).await;
        info!(pid = relay.handle.pid(), ?kind, "relay stopped");
        self.status().await
    }

    async fn write_config(&self, path: &Path, settings: &AppSettings) -> Result<(), RelayError> {
        let yaml = render_config(settings)?;
        tokio::fs::create_dir_all(&self.runtime_dir).await?;
        tokio::fs::write(path, yaml).await?;
        Ok(())
    }

    async fn set_status(&self, status: RtspServerStatus) -> RtspServerStatus {
        *self.status.write().await = status.clone();
        self.events.server_state(&status);
        status
    }
}

/// Exit hook for the relay driver
struct RelayExit {
    status: Arc<RwLock<RtspServerStatus>>,
    events: EventBus,
    stop_requested: Arc<AtomicBool>,
}

impl RelayExit {
    async fn run(self, outcome: ExitOutcome) {
        let status = if self.stop_requested.load(Ordering::SeqCst) {
            RtspServerStatus::new(ServerState::Stopped, None, None)
        } else {
            let message = outcome.describe(RELAY_NAME);
            warn!(error = %message, "relay exited unexpectedly");
            self.events.server_log(LogOrigin::Supervisor, message.clone());
            RtspServerStatus::new(ServerState::Error, None, Some(message))
        };

        *self.status.write().await = status.clone();
        self.events.server_state(&status);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::binaries::BundledBinaries;
    use crate::capabilities::tests::write_script;
    use crate::events::Event;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn relay_in(dir: &TempDir, body: &str) -> RelaySupervisor {
        let relay = write_script(dir.path(), "mediamtx", body);
        let binaries = BundledBinaries::new(dir.path()).with_relay(relay);
        RelaySupervisor::new(Arc::new(binaries), dir.path().join("run"), EventBus::new(256))
    }

    async fn wait_for_log(rx: &mut broadcast::Receiver<Event>, needle: &str) {
        let wait = async {
            loop {
                if let Ok(Event::ServerLog { line, .. }) = rx.recv().await {
                    if line.contains(needle) {
                        return;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("relay log line not seen");
    }

    async fn wait_for_state(rx: &mut broadcast::Receiver<Event>, state: ServerState) -> RtspServerStatus {
        let wait = async {
            loop {
                if let Ok(Event::ServerStateChanged { status }) = rx.recv().await {
                    if status.state == state {
                        return status;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("relay state not reached")
    }

    #[test]
    fn test_render_open_config() {
        let yaml = render_config(&AppSettings::default()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["logLevel"], "info");
        assert_eq!(doc["rtspAddress"], "0.0.0.0:8554");
        assert_eq!(doc["rtspTransports"][0], "tcp");
        assert_eq!(doc["rtspTransports"][1], "udp");
        assert_eq!(doc["encryption"], "no");
        assert_eq!(doc["authInternalUsers"][0]["user"], "any");
        assert_eq!(doc["authInternalUsers"][0]["permissions"][0]["action"], "publish");
        assert_eq!(doc["authInternalUsers"][0]["permissions"][1]["action"], "read");
        assert_eq!(doc["paths"]["all_others"]["source"], "publisher");
    }

    #[test]
    fn test_render_authenticated_config() {
        let settings = AppSettings {
            host: "::".to_string(),
            port: 9554,
            auth_enabled: true,
            username: "studio".to_string(),
            password: "s3cret".to_string(),
            ..AppSettings::default()
        };
        let doc: serde_yaml::Value = serde_yaml::from_str(&render_config(&settings).unwrap()).unwrap();

        assert_eq!(doc["rtspAddress"], "[::]:9554");
        assert_eq!(doc["authInternalUsers"][0]["user"], "studio");
        assert_eq!(doc["authInternalUsers"][0]["pass"], "s3cret");
    }

    #[tokio::test]
    async fn test_start_writes_config_and_runs() {
        let dir = TempDir::new().unwrap();
        let relay = relay_in(&dir, "test -f \"$1\" && echo ready\nexec sleep 30\n");
        let mut rx = relay.events.subscribe();

        let status = relay.start(&AppSettings::default()).await.unwrap();
        assert_eq!(status.state, ServerState::Running);
        assert!(status.pid.is_some());
        assert!(relay.is_serving().await);

        wait_for_log(&mut rx, "ready").await;
        let written = std::fs::read_to_string(relay.config_path()).unwrap();
        assert!(written.contains("all_others"));

        // Idempotent while running
        let again = relay.start(&AppSettings::default()).await.unwrap();
        assert_eq!(again.pid, status.pid);

        let stopped = relay.stop().await;
        assert_eq!(stopped.state, ServerState::Stopped);
        assert_eq!(stopped.pid, None);
        assert!(!relay.is_serving().await);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let relay = relay_in(&dir, "echo 'bind: address already in use' >&2\nexit 2\n");
        let mut rx = relay.events.subscribe();

        relay.start(&AppSettings::default()).await.unwrap();
        let status = wait_for_state(&mut rx, ServerState::Error).await;
        assert_eq!(status.last_error.as_deref(), Some("mediamtx exited with code 2"));
        assert_eq!(relay.status().await.state, ServerState::Error);
        assert!(!relay.is_serving().await);
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let dir = TempDir::new().unwrap();
        let relay = relay_in(&dir, "exec sleep 30\n");

        let first = relay.start(&AppSettings::default()).await.unwrap();
        let settings = AppSettings {
            port: 9000,
            ..AppSettings::default()
        };
        let second = relay.restart(&settings).await.unwrap();

        assert_eq!(second.state, ServerState::Running);
        assert_ne!(first.pid, second.pid);
        let written = std::fs::read_to_string(relay.config_path()).unwrap();
        assert!(written.contains("0.0.0.0:9000"));

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_missing_binary_reports_error() {
        let dir = TempDir::new().unwrap();
        let binaries = BundledBinaries::new(dir.path()).with_relay(dir.path().join("missing"));
        let relay = RelaySupervisor::new(Arc::new(binaries), dir.path(), EventBus::default());

        let err = relay.start(&AppSettings::default()).await.unwrap_err();
        assert!(matches!(err, RelayError::BinaryNotFound(_)));
        assert_eq!(relay.status().await.state, ServerState::Error);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_stopped() {
        let dir = TempDir::new().unwrap();
        let relay = relay_in(&dir, "exit 0\n");
        assert_eq!(relay.stop().await.state, ServerState::Stopped);
    }
}
