//! Durable store for task definitions and application settings.
//!
//! Everything lives in one JSON document. Every mutation is applied to a copy
//! of the in-memory state, written to disk while the state lock is held, and
//! only then committed, so writes are totally ordered and a failed write
//! leaves memory and disk in agreement.

use crate::task::{current_timestamp_ms, normalize_path, NewTask, StreamTask, TaskPatch, TaskStatus};
use relaycast_config::{AppSettings, SettingsError, SettingsPatch};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No task with the given id.
    #[error("task '{0}' not found")]
    NotFound(String),

    /// Another task already publishes on this routing key.
    #[error("path '{0}' is already used by another task")]
    PathTaken(String),

    /// The task payload is malformed.
    #[error("invalid task: {0}")]
    InvalidInput(String),

    /// The settings update failed validation.
    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),

    /// IO error reading or writing the store file.
    #[error("store IO error: {0}")]
    Io(#[from] io::Error),

    /// The store file could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    settings: AppSettings,
    #[serde(default)]
    tasks: Vec<StreamTask>,
}

impl StoreState {
    fn find(&self, id: &str) -> Result<usize, StoreError> {
        self.tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn ensure_path_free(&self, path: &str, except_id: Option<&str>) -> Result<(), StoreError> {
        let taken = self
            .tasks
            .iter()
            .any(|t| t.path == path && Some(t.id.as_str()) != except_id);
        if taken {
            return Err(StoreError::PathTaken(path.to_string()));
        }
        Ok(())
    }
}

/// JSON-file backed store for tasks and settings.
pub struct TaskStore {
    file: PathBuf,
    state: Mutex<StoreState>,
}

impl TaskStore {
    /// Open the store at `file`, creating it from `default_settings` if absent.
    ///
    /// No subprocess survives a restart, so any task persisted as `starting`
    /// or `running` is reset to `stopped` before the store is returned.
    pub async fn open(file: impl Into<PathBuf>, default_settings: AppSettings) -> Result<Self, StoreError> {
        let file = file.into();

        let (mut state, existed) = match tokio::fs::read(&file).await {
            Ok(bytes) => (serde_json::from_slice::<StoreState>(&bytes)?, true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (
                StoreState {
                    settings: default_settings,
                    tasks: Vec::new(),
                },
                false,
            ),
            Err(e) => return Err(e.into()),
        };

        let mut reconciled = 0usize;
        for task in state.tasks.iter_mut().filter(|t| t.status.is_active()) {
            task.set_runtime_state(TaskStatus::Stopped, None);
            reconciled += 1;
        }

        if !existed || reconciled > 0 {
            write_atomic(&file, &state).await?;
        }

        info!(
            file = %file.display(),
            tasks = state.tasks.len(),
            reconciled,
            "task store opened"
        );

        Ok(Self {
            file,
            state: Mutex::new(state),
        })
    }

    /// Location of the backing file.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// All tasks in creation order.
    pub async fn list(&self) -> Vec<StreamTask> {
        self.state.lock().await.tasks.clone()
    }

    pub async fn get(&self, id: &str) -> Option<StreamTask> {
        self.state
            .lock()
            .await
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Create a task with status `created`.
    pub async fn create(&self, payload: NewTask) -> Result<StreamTask, StoreError> {
        let path = normalize_path(&payload.path)
            .ok_or_else(|| StoreError::InvalidInput("path must not be empty".to_string()))?;
        let input = payload.input.trim().to_string();
        if input.is_empty() {
            return Err(StoreError::InvalidInput("input must not be empty".to_string()));
        }
        validate_caps(payload.bitrate_kbps, payload.fps)?;

        let mut state = self.state.lock().await;
        state.ensure_path_free(&path, None)?;

        let now = current_timestamp_ms();
        let name = match payload.name.trim() {
            "" => path.clone(),
            name => name.to_string(),
        };
        let task = StreamTask {
            id: Uuid::new_v4().to_string(),
            name,
            input,
            path,
            transport: payload.transport,
            looped: payload.looped,
            hw_accel: payload.hw_accel,
            video_codec: payload.video_codec,
            audio_codec: payload.audio_codec,
            bitrate_kbps: payload.bitrate_kbps,
            fps: payload.fps,
            status: TaskStatus::Created,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let mut next = state.clone();
        next.tasks.push(task.clone());
        self.commit(&mut state, next).await?;

        debug!(task_id = %task.id, path = %task.path, "task created");
        Ok(task)
    }

    /// Apply a partial update to a task definition.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<StreamTask, StoreError> {
        let mut state = self.state.lock().await;
        let idx = state.find(id)?;
        let mut task = state.tasks[idx].clone();

        if let Some(raw) = &patch.path {
            let path = normalize_path(raw)
                .ok_or_else(|| StoreError::InvalidInput("path must not be empty".to_string()))?;
            state.ensure_path_free(&path, Some(id))?;
            task.path = path;
        }
        if let Some(name) = &patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(StoreError::InvalidInput("name must not be empty".to_string()));
            }
            task.name = name.to_string();
        }
        if let Some(input) = &patch.input {
            let input = input.trim();
            if input.is_empty() {
                return Err(StoreError::InvalidInput("input must not be empty".to_string()));
            }
            task.input = input.to_string();
        }
        if let Some(transport) = patch.transport {
            task.transport = transport;
        }
        if let Some(looped) = patch.looped {
            task.looped = looped;
        }
        if let Some(policy) = patch.hw_accel {
            task.hw_accel = policy;
        }
        if let Some(codec) = patch.video_codec {
            task.video_codec = codec;
        }
        if let Some(codec) = patch.audio_codec {
            task.audio_codec = codec;
        }
        if let Some(bitrate) = patch.bitrate_kbps {
            task.bitrate_kbps = bitrate;
        }
        if let Some(fps) = patch.fps {
            task.fps = fps;
        }
        validate_caps(task.bitrate_kbps, task.fps)?;
        task.touch();

        let mut next = state.clone();
        next.tasks[idx] = task.clone();
        self.commit(&mut state, next).await?;
        Ok(task)
    }

    /// Delete a task. Returns false if it did not exist.
    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Ok(idx) = state.find(id) else {
            return Ok(false);
        };

        let mut next = state.clone();
        next.tasks.remove(idx);
        self.commit(&mut state, next).await?;
        Ok(true)
    }

    /// Record the runtime status observed by the supervisor.
    ///
    /// Unlike definition edits, the in-memory record takes the new status even
    /// when the file write fails, so readers always see the status matching
    /// the live process registry. The write failure is still returned.
    pub async fn set_runtime_state(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<StreamTask, StoreError> {
        let mut state = self.state.lock().await;
        let idx = state.find(id)?;

        state.tasks[idx].set_runtime_state(status, error);
        let task = state.tasks[idx].clone();
        write_atomic(&self.file, &state).await?;
        Ok(task)
    }

    pub async fn settings(&self) -> AppSettings {
        self.state.lock().await.settings.clone()
    }

    /// Validate and persist a settings update.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<AppSettings, StoreError> {
        let mut state = self.state.lock().await;
        let settings = state.settings.apply(patch)?;

        let mut next = state.clone();
        next.settings = settings.clone();
        self.commit(&mut state, next).await?;
        Ok(settings)
    }

    async fn commit(&self, current: &mut StoreState, next: StoreState) -> Result<(), StoreError> {
        write_atomic(&self.file, &next).await?;
        *current = next;
        Ok(())
    }
}

fn validate_caps(bitrate_kbps: Option<u32>, fps: Option<u32>) -> Result<(), StoreError> {
    if bitrate_kbps == Some(0) {
        return Err(StoreError::InvalidInput("bitrate must be positive".to_string()));
    }
    if fps == Some(0) {
        return Err(StoreError::InvalidInput("frame rate must be positive".to_string()));
    }
    Ok(())
}

/// Write the state to a sibling temp file and rename it into place.
async fn write_atomic(file: &Path, state: &StoreState) -> Result<(), StoreError> {
    if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(state)?;
    let mut tmp = file.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, file).await?;
    Ok(())
}
