//! Daemon host for relaycast
//!
//! Wires the store, capability detector, task supervisor and relay
//! supervisor together and owns the process-wide startup and teardown order.

use crate::api_server::{run_api_server, ServerError};
use crate::binaries::{BinaryResolver, BundledBinaries};
use crate::capabilities::CapabilityDetector;
use crate::events::{spawn_log_sink, EventBus, DEFAULT_EVENT_CAPACITY};
use crate::relay::{RelayError, RelaySupervisor, RtspServerStatus};
use crate::store::{StoreError, TaskStore};
use crate::supervisor::ProcessSupervisor;
use relaycast_config::{AppSettings, DaemonConfig, SettingsPatch};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Task store could not be opened or written
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Relay server failed to start
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// API server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// All runtime components of a running daemon
pub struct Daemon {
    /// Configuration the daemon was built from
    pub config: DaemonConfig,
    store: Arc<TaskStore>,
    detector: Arc<CapabilityDetector>,
    supervisor: Arc<ProcessSupervisor>,
    relay: Arc<RelaySupervisor>,
    events: EventBus,
}

impl Daemon {
    /// Build the daemon, resolving binaries from `config.paths`
    ///
    /// Opening the store resets any task persisted as running.
    pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let binaries = Arc::new(BundledBinaries::from_config(&config.paths));
        Self::with_binaries(config, binaries).await
    }

    /// Build the daemon with an explicit binary resolver
    pub async fn with_binaries(
        config: DaemonConfig,
        binaries: Arc<dyn BinaryResolver>,
    ) -> Result<Self, DaemonError> {
        let store = Arc::new(TaskStore::open(config.store_path(), config.defaults.clone()).await?);
        let events = EventBus::new(DEFAULT_EVENT_CAPACITY);
        let detector = Arc::new(CapabilityDetector::new(binaries.clone()));
        let supervisor = Arc::new(ProcessSupervisor::new(
            store.clone(),
            detector.clone(),
            binaries.clone(),
            events.clone(),
        ));
        let relay = Arc::new(RelaySupervisor::new(
            binaries,
            config.paths.runtime_dir.clone(),
            events.clone(),
        ));

        info!(
            store = %store.file().display(),
            runtime_dir = %config.paths.runtime_dir.display(),
            "daemon initialized"
        );

        Ok(Self {
            config,
            store,
            detector,
            supervisor,
            relay,
            events,
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn detector(&self) -> &Arc<CapabilityDetector> {
        &self.detector
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn relay(&self) -> &Arc<RelaySupervisor> {
        &self.relay
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start the relay with the stored settings
    pub async fn start_relay(&self) -> Result<RtspServerStatus, RelayError> {
        let settings = self.store.settings().await;
        self.relay.start(&settings).await
    }

    /// Restart the relay with the stored settings
    pub async fn restart_relay(&self) -> Result<RtspServerStatus, RelayError> {
        let settings = self.store.settings().await;
        self.relay.restart(&settings).await
    }

    /// Validate and persist new settings
    ///
    /// A relay that is already serving is restarted so the change takes
    /// effect; a failed restart shows up in the relay status.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<AppSettings, DaemonError> {
        let settings = self.store.update_settings(patch).await?;
        info!(
            host = %settings.host,
            port = settings.port,
            auth = settings.auth_enabled,
            default_hw_accel = %settings.default_hw_accel,
            "settings updated"
        );

        if self.relay.is_serving().await {
            if let Err(e) = self.relay.restart(&settings).await {
                warn!(error = %e, "relay restart after settings change failed");
            }
        }
        Ok(settings)
    }

    /// Mirror the event stream into the log
    pub fn start_event_log(&self) -> tokio::task::JoinHandle<()> {
        spawn_log_sink(&self.events)
    }

    /// Start the HTTP control API in the background
    pub fn start_api_server(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            let addr = daemon.config.api.bind_addr.clone();
            if let Err(e) = run_api_server(daemon, &addr).await {
                warn!(error = %e, "API server error");
            }
        })
    }

    /// Stop every task, then the relay
    ///
    /// Must complete before the host process exits.
    pub async fn shutdown(&self) {
        info!(live = self.supervisor.live_ids().await.len(), "shutting down");
        self.supervisor.stop_all().await;
        self.relay.stop().await;
        info!("shutdown complete");
    }
}
