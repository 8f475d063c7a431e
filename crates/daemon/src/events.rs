//! Event surface for the display layer.
//!
//! Supervisors publish lifecycle changes and subprocess output on a broadcast
//! channel. Sends are best-effort: a lagging or absent subscriber never blocks
//! a supervisor.

use crate::relay::RtspServerStatus;
use crate::task::{current_timestamp_ms, StreamTask};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default channel capacity before slow subscribers start lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOrigin {
    Stdout,
    Stderr,
    /// Emitted by the supervisor itself
    Supervisor,
}

impl LogOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOrigin::Stdout => "stdout",
            LogOrigin::Stderr => "stderr",
            LogOrigin::Supervisor => "supervisor",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskStateChanged {
        task: StreamTask,
    },
    TaskLog {
        task_id: String,
        origin: LogOrigin,
        line: String,
        timestamp_ms: i64,
    },
    ServerStateChanged {
        status: RtspServerStatus,
    },
    ServerLog {
        origin: LogOrigin,
        line: String,
        timestamp_ms: i64,
    },
}

/// Cloneable publisher handle
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn task_state(&self, task: &StreamTask) {
        self.emit(Event::TaskStateChanged { task: task.clone() });
    }

    pub fn task_log(&self, task_id: &str, origin: LogOrigin, line: impl Into<String>) {
        self.emit(Event::TaskLog {
            task_id: task_id.to_string(),
            origin,
            line: line.into(),
            timestamp_ms: current_timestamp_ms(),
        });
    }

    pub fn server_state(&self, status: &RtspServerStatus) {
        self.emit(Event::ServerStateChanged {
            status: status.clone(),
        });
    }

    pub fn server_log(&self, origin: LogOrigin, line: impl Into<String>) {
        self.emit(Event::ServerLog {
            origin,
            line: line.into(),
            timestamp_ms: current_timestamp_ms(),
        });
    }
}

/// Mirror every event into `tracing` until the bus closes
pub fn spawn_log_sink(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log sink lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &Event) {
    match event {
        Event::TaskStateChanged { task } => info!(
            task_id = %task.id,
            path = %task.path,
            status = %task.status,
            error = task.last_error.as_deref().unwrap_or(""),
            "task state changed"
        ),
        Event::TaskLog {
            task_id,
            origin,
            line,
            ..
        } => debug!(task_id = %task_id, origin = origin.as_str(), "{}", line),
        Event::ServerStateChanged { status } => info!(
            state = status.state.as_str(),
            pid = ?status.pid,
            error = status.last_error.as_deref().unwrap_or(""),
            "relay state changed"
        ),
        Event::ServerLog { origin, line, .. } => {
            debug!(target: "relaycast::relay", origin = origin.as_str(), "{}", line)
        }
    }
}
