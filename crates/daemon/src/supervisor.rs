//! Task process supervisor
//!
//! Owns the registry of live transcoder processes and runs the per-task
//! state machine: `created/stopped/error -> starting -> running ->
//! stopped|error`. The registry, not the persisted status, decides whether a
//! task has a process.

use crate::binaries::{check_executable, BinaryError, BinaryResolver};
use crate::capabilities::CapabilityDetector;
use crate::command::{synthesize, SynthesisError};
use crate::events::{EventBus, LogOrigin};
use crate::logs::{spawn_line_pump, TRANSCODER_NOISE};
use crate::process::{self, ExitOutcome, ProcessHandle, STOP_GRACE};
use crate::store::{StoreError, TaskStore};
use crate::task::{NewTask, StreamTask, TaskPatch, TaskStatus};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TRANSCODER_NAME: &str = "ffmpeg";

/// Error type for supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The transcoder binary is missing or not executable
    #[error(transparent)]
    BinaryNotFound(#[from] BinaryError),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    /// The task has a live process and cannot be edited
    #[error("task '{0}' is running; stop it before editing")]
    TaskBusy(String),

    #[error("input '{input}' is not readable: {reason}")]
    InputUnreadable { input: String, reason: String },

    /// Command synthesis failed (invalid task or missing encoder)
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SupervisorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SupervisorError::TaskNotFound(id),
            other => SupervisorError::Store(other),
        }
    }
}

/// A registered transcoder process
struct LiveProcess {
    handle: ProcessHandle,
    generation: u64,
    stop_requested: Arc<AtomicBool>,
}

type Registry = Arc<Mutex<HashMap<String, LiveProcess>>>;

/// Supervises one transcoder process per running task
pub struct ProcessSupervisor {
    store: Arc<TaskStore>,
    detector: Arc<CapabilityDetector>,
    binaries: Arc<dyn BinaryResolver>,
    events: EventBus,
    registry: Registry,
    /// Per-task locks serializing start/stop/update/remove
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    generation: AtomicU64,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(
        store: Arc<TaskStore>,
        detector: Arc<CapabilityDetector>,
        binaries: Arc<dyn BinaryResolver>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            detector,
            binaries,
            events,
            registry: Arc::new(Mutex::new(HashMap::new())),
            task_locks: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            stop_grace: STOP_GRACE,
        }
    }

    /// Override the graceful stop period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub async fn list(&self) -> Vec<StreamTask> {
        self.store.list().await
    }

    /// Whether a live process is registered for `id`
    pub async fn is_live(&self, id: &str) -> bool {
        self.registry.lock().await.contains_key(id)
    }

    /// Ids of all tasks with a live process, sorted
    pub async fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pid of the live process for `id`
    pub async fn live_pid(&self, id: &str) -> Option<u32> {
        self.registry.lock().await.get(id).map(|p| p.handle.pid())
    }

    pub async fn create(&self, payload: NewTask) -> Result<StreamTask, SupervisorError> {
        let task = self.store.create(payload).await?;
        self.events.task_state(&task);
        Ok(task)
    }

    /// Edit a task definition; rejected while it has a live process
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<StreamTask, SupervisorError> {
        let lock = self.task_lock(id).await;
        let guard = lock.lock().await;
        let result = self.update_locked(id, patch).await;
        drop(guard);
        self.release_unknown(id, lock, &result).await;
        result
    }

    async fn update_locked(&self, id: &str, patch: TaskPatch) -> Result<StreamTask, SupervisorError> {
        if self.is_live(id).await {
            return Err(SupervisorError::TaskBusy(id.to_string()));
        }
        let task = self.store.update(id, patch).await?;
        self.events.task_state(&task);
        Ok(task)
    }

    /// Stop the task if needed, then delete it. Returns false if it did not exist.
    pub async fn remove(&self, id: &str) -> Result<bool, SupervisorError> {
        let lock = self.task_lock(id).await;
        let guard = lock.lock().await;

        if self.is_live(id).await {
            self.stop_locked(id).await?;
        }
        let removed = self.store.remove(id).await?;

        drop(guard);
        self.task_locks.lock().await.remove(id);
        if removed {
            info!(task_id = %id, "task removed");
        }
        Ok(removed)
    }

    /// Launch the transcoder for a task
    ///
    /// Returns the current record unchanged if a process is already live.
    /// A launch failure is recorded on the task as `error` and returned as
    /// `Ok`. Failed checks before launching are returned as `Err`, as are
    /// store write failures, which also leave the task in `error` with no
    /// process.
    pub async fn start(&self, id: &str) -> Result<StreamTask, SupervisorError> {
        let lock = self.task_lock(id).await;
        let guard = lock.lock().await;
        let result = self.start_locked(id).await;
        drop(guard);
        self.release_unknown(id, lock, &result).await;
        result
    }

    async fn start_locked(&self, id: &str) -> Result<StreamTask, SupervisorError> {
        if self.is_live(id).await {
            return self
                .store
                .get(id)
                .await
                .ok_or_else(|| SupervisorError::TaskNotFound(id.to_string()));
        }

        let binary = self.binaries.transcoder();
        self.binaries.ensure_executable(&binary);
        check_executable(&binary)?;

        let task = self
            .store
            .get(id)
            .await
            .ok_or_else(|| SupervisorError::TaskNotFound(id.to_string()))?;
        check_input_readable(&task.input).await?;

        let settings = self.store.settings().await;
        let caps = self.detector.scan(false).await;
        let plan = synthesize(&task, &settings, &caps)?;

        let task = match self.store.set_runtime_state(id, TaskStatus::Starting, None).await {
            Ok(task) => task,
            Err(e) => {
                self.record_error(id, format!("failed to record task state: {}", e))
                    .await;
                return Err(e.into());
            }
        };
        self.events.task_state(&task);
        debug!(task_id = %id, args = ?plan.args, "launching transcoder");

        let spawned = Command::new(&binary)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %id, error = %e, "transcoder launch failed");
                let message = format!("failed to launch {}: {}", TRANSCODER_NAME, e);
                return self
                    .record_error(id, message)
                    .await
                    .ok_or_else(|| SupervisorError::TaskNotFound(id.to_string()));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            self.pump(id, stdout, LogOrigin::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump(id, stderr, LogOrigin::Stderr);
        }

        // Persist `running` before the driver exists so the exit transition
        // can never be overwritten by it
        let task = match self.store.set_runtime_state(id, TaskStatus::Running, None).await {
            Ok(task) => task,
            Err(e) => {
                if let Err(kill_err) = child.start_kill() {
                    debug!(task_id = %id, error = %kill_err, "transcoder already gone");
                }
                if let Err(wait_err) = child.wait().await {
                    debug!(task_id = %id, error = %wait_err, "failed to reap transcoder");
                }
                self.record_error(id, format!("failed to record task state: {}", e))
                    .await;
                return Err(e.into());
            }
        };
        self.events.task_state(&task);
        self.events.task_log(
            id,
            LogOrigin::Supervisor,
            format!(
                "publishing to {} using {} ({})",
                plan.display_url, plan.encoder, plan.policy
            ),
        );

        let mut registry = self.registry.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop_requested = Arc::new(AtomicBool::new(false));
        let hook = TaskExit {
            task_id: id.to_string(),
            generation,
            stop_requested: stop_requested.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
        };
        let handle = process::drive(child, move |outcome| hook.run(outcome));
        info!(
            task_id = %id,
            pid = handle.pid(),
            encoder = %plan.encoder,
            url = %plan.display_url,
            "task started"
        );
        registry.insert(
            id.to_string(),
            LiveProcess {
                handle,
                generation,
                stop_requested,
            },
        );

        Ok(task)
    }

    /// Stop a task's process and return the final record
    ///
    /// Without a live process the stored status is reconciled to `stopped`.
    pub async fn stop(&self, id: &str) -> Result<StreamTask, SupervisorError> {
        let lock = self.task_lock(id).await;
        let guard = lock.lock().await;
        let result = self.stop_locked(id).await;
        drop(guard);
        self.release_unknown(id, lock, &result).await;
        result
    }

    /// Stop every live task, one at a time
    pub async fn stop_all(&self) {
        for id in self.live_ids().await {
            if let Err(e) = self.stop(&id).await {
                warn!(task_id = %id, error = %e, "failed to stop task during shutdown");
            }
        }
    }

    async fn stop_locked(&self, id: &str) -> Result<StreamTask, SupervisorError> {
        let task = self
            .store
            .get(id)
            .await
            .ok_or_else(|| SupervisorError::TaskNotFound(id.to_string()))?;

        let live = self
            .registry
            .lock()
            .await
            .get(id)
            .map(|p| (p.handle.clone(), p.stop_requested.clone()));

        let Some((handle, stop_requested)) = live else {
            if task.status == TaskStatus::Stopped {
                return Ok(task);
            }
            let task = self
                .store
                .set_runtime_state(id, TaskStatus::Stopped, None)
                .await?;
            self.events.task_state(&task);
            return Ok(task);
        };

        stop_requested.store(true, Ordering::SeqCst);
        let kind = handle.shutdown(self.stop_grace).await;
        info!(task_id = %id, pid = handle.pid(), ?kind, "task stopped");

        self.store
            .get(id)
            .await
            .ok_or_else(|| SupervisorError::TaskNotFound(id.to_string()))
    }

    async fn task_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.task_locks
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Forget the lock of an id that turned out not to exist
    async fn release_unknown<T>(
        &self,
        id: &str,
        lock: Arc<Mutex<()>>,
        result: &Result<T, SupervisorError>,
    ) {
        if !matches!(result, Err(SupervisorError::TaskNotFound(_))) {
            return;
        }
        let mut locks = self.task_locks.lock().await;
        // Only the map and this caller hold it
        let unused = locks
            .get(id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if unused {
            locks.remove(id);
        }
    }

    /// Record a failed start as `error` and announce it
    ///
    /// The status is applied in memory even if the store cannot be written.
    async fn record_error(&self, id: &str, message: String) -> Option<StreamTask> {
        self.events.task_log(id, LogOrigin::Supervisor, message.clone());
        let task = match self
            .store
            .set_runtime_state(id, TaskStatus::Error, Some(message))
            .await
        {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(task_id = %id, error = %e, "failed to persist task error");
                self.store.get(id).await
            }
        };
        if let Some(task) = &task {
            self.events.task_state(task);
        }
        task
    }

    fn pump<R>(&self, id: &str, reader: R, origin: LogOrigin)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        let task_id = id.to_string();
        spawn_line_pump(reader, origin, TRANSCODER_NOISE, move |origin, line| {
            events.task_log(&task_id, origin, line)
        });
    }
}

/// Exit hook for a task's driver
struct TaskExit {
    task_id: String,
    generation: u64,
    stop_requested: Arc<AtomicBool>,
    store: Arc<TaskStore>,
    registry: Registry,
    events: EventBus,
}

impl TaskExit {
    async fn run(self, outcome: ExitOutcome) {
        let requested = self.stop_requested.load(Ordering::SeqCst);
        let (status, error) = if requested || outcome.success() {
            (TaskStatus::Stopped, None)
        } else {
            (TaskStatus::Error, Some(outcome.describe(TRANSCODER_NAME)))
        };

        // Hold the registry while persisting so a new start cannot slip in
        // between deregistration and the final status write
        let mut registry = self.registry.lock().await;
        let result = self
            .store
            .set_runtime_state(&self.task_id, status, error.clone())
            .await;
        if registry.get(&self.task_id).map(|p| p.generation) == Some(self.generation) {
            registry.remove(&self.task_id);
        }
        drop(registry);

        let line = match &error {
            Some(message) => message.clone(),
            None if requested => format!("{} stopped", TRANSCODER_NAME),
            None => format!("{} finished", TRANSCODER_NAME),
        };
        self.events.task_log(&self.task_id, LogOrigin::Supervisor, line);

        match result {
            Ok(task) => self.events.task_state(&task),
            Err(e) => warn!(task_id = %self.task_id, error = %e, "failed to record task exit"),
        }
    }
}

/// Check that a local input can be opened; network URLs are not checked
async fn check_input_readable(input: &str) -> Result<(), SupervisorError> {
    if input.contains("://") {
        return Ok(());
    }

    let unreadable = |reason: String| SupervisorError::InputUnreadable {
        input: input.to_string(),
        reason,
    };

    let metadata = tokio::fs::metadata(input)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unreadable("not a regular file".to_string()));
    }
    tokio::fs::File::open(input)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    Ok(())
}
