//! Stream task model.
//!
//! A task is one configured transcode-and-publish job: an input file pushed
//! to the relay server under a unique routing key.

use relaycast_config::HwAccelPolicy;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Runtime status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task was created and never started.
    #[default]
    Created,
    /// A subprocess launch is in progress.
    Starting,
    /// The transcoder is running.
    Running,
    /// The transcoder exited normally or was stopped on request.
    Stopped,
    /// The transcoder failed to launch or exited unexpectedly.
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Starting => "starting",
            TaskStatus::Running => "running",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Error => "error",
        }
    }

    /// Check if the status claims a live subprocess.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Starting | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTSP transport used when publishing to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Interleaved over the RTSP connection.
    #[default]
    Tcp,
    /// Separate RTP/RTCP datagrams.
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// Codec family used for re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFamily {
    H264,
    Hevc,
}

impl CodecFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecFamily::H264 => "h264",
            CodecFamily::Hevc => "hevc",
        }
    }
}

/// Video handling for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// Pass the input video through untouched.
    Copy,
    #[default]
    H264,
    Hevc,
}

impl VideoCodec {
    /// Codec family to encode with, `None` for pass-through.
    pub fn family(&self) -> Option<CodecFamily> {
        match self {
            VideoCodec::Copy => None,
            VideoCodec::H264 => Some(CodecFamily::H264),
            VideoCodec::Hevc => Some(CodecFamily::Hevc),
        }
    }
}

/// Audio handling for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Copy,
    #[default]
    Aac,
    Opus,
    /// Drop audio entirely.
    None,
}

/// A stream task definition plus its last observed runtime state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamTask {
    /// Unique task identifier (UUID).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Input media file, or a network URL.
    pub input: String,
    /// Normalized routing key on the relay server.
    pub path: String,
    #[serde(default)]
    pub transport: Transport,
    /// Loop the input forever.
    #[serde(default, rename = "loop")]
    pub looped: bool,
    #[serde(default)]
    pub hw_accel: HwAccelPolicy,
    #[serde(default)]
    pub video_codec: VideoCodec,
    #[serde(default)]
    pub audio_codec: AudioCodec,
    /// Video bitrate cap in kbps.
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    /// Output frame rate cap.
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Unix timestamp (milliseconds) when the task was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when the task was last updated.
    pub updated_at: i64,
}

impl StreamTask {
    /// Update the task's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Set the runtime status and error, updating the timestamp.
    ///
    /// Any status other than `Error` clears the error message.
    pub fn set_runtime_state(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        self.last_error = match status {
            TaskStatus::Error => error,
            _ => None,
        };
        self.touch();
    }
}

/// Payload for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewTask {
    pub name: String,
    pub input: String,
    pub path: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default, rename = "loop")]
    pub looped: bool,
    #[serde(default)]
    pub hw_accel: HwAccelPolicy,
    #[serde(default)]
    pub video_codec: VideoCodec,
    #[serde(default)]
    pub audio_codec: AudioCodec,
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub fps: Option<u32>,
}

/// Partial task update; `None` fields are left unchanged.
///
/// `bitrate_kbps` and `fps` use a nested option so that `Some(None)` clears
/// the cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(default, rename = "loop")]
    pub looped: Option<bool>,
    #[serde(default)]
    pub hw_accel: Option<HwAccelPolicy>,
    #[serde(default)]
    pub video_codec: Option<VideoCodec>,
    #[serde(default)]
    pub audio_codec: Option<AudioCodec>,
    #[serde(default, with = "double_option")]
    pub bitrate_kbps: Option<Option<u32>>,
    #[serde(default, with = "double_option")]
    pub fps: Option<Option<u32>>,
}

/// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Normalize a routing key.
///
/// Strips leading slashes, collapses whitespace runs to a single hyphen,
/// lower-cases the result and drops anything outside `[a-z0-9._~/-]`.
/// Returns `None` when nothing is left.
pub fn normalize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start_matches(|c: char| c == '/' || c.is_whitespace());
    let collapsed = trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    let kept: String = collapsed.chars().filter(|c| is_route_char(*c)).collect();
    let normalized = kept.trim_start_matches('/');

    if normalized.is_empty() {
        None
    } else {
        Some(normalized.to_string())
    }
}

fn is_route_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '~' | '/' | '-')
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_task(path: &str) -> StreamTask {
        StreamTask {
            id: "task-1".to_string(),
            name: "Demo".to_string(),
            input: "/media/demo.mp4".to_string(),
            path: path.to_string(),
            transport: Transport::Tcp,
            looped: false,
            hw_accel: HwAccelPolicy::Auto,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
            bitrate_kbps: None,
            fps: None,
            status: TaskStatus::Created,
            last_error: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("Demo Room"), Some("demo-room".to_string()));
        assert_eq!(normalize_path("///live/cam 1"), Some("live/cam-1".to_string()));
        assert_eq!(normalize_path("  a \t  b  "), Some("a-b".to_string()));
        assert_eq!(normalize_path("demo-room"), Some("demo-room".to_string()));
        assert_eq!(normalize_path("///"), None);
        assert_eq!(normalize_path("   "), None);
        assert_eq!(normalize_path(""), None);
    }

    #[test]
    fn test_normalize_path_drops_url_delimiters() {
        assert_eq!(normalize_path("lobby?a"), Some("lobbya".to_string()));
        assert_eq!(normalize_path("lobby#a"), Some("lobbya".to_string()));
        assert_eq!(normalize_path("50% Off"), Some("50-off".to_string()));
        assert_eq!(normalize_path("Café Stage"), Some("caf-stage".to_string()));
        assert_eq!(normalize_path("?/cam"), Some("cam".to_string()));
        assert_eq!(normalize_path("???"), None);
    }

    #[test]
    fn test_status_display_and_activity() {
        assert_eq!(TaskStatus::Created.to_string(), "created");
        assert_eq!(TaskStatus::Starting.to_string(), "starting");
        assert_eq!(TaskStatus::Running.to_string(), "running");
        assert_eq!(TaskStatus::Stopped.to_string(), "stopped");
        assert_eq!(TaskStatus::Error.to_string(), "error");

        assert!(TaskStatus::Starting.is_active());
        assert!(TaskStatus::Running.is_active());
        assert!(!TaskStatus::Created.is_active());
        assert!(!TaskStatus::Stopped.is_active());
        assert!(!TaskStatus::Error.is_active());
    }

    #[test]
    fn test_set_runtime_state_clears_error() {
        let mut task = make_task("demo");
        task.set_runtime_state(TaskStatus::Error, Some("ffmpeg exited with code 1".into()));
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.last_error.as_deref(), Some("ffmpeg exited with code 1"));
        assert!(task.updated_at > 1);

        task.set_runtime_state(TaskStatus::Starting, Some("ignored".into()));
        assert_eq!(task.status, TaskStatus::Starting);
        assert!(task.last_error.is_none());
    }

    #[test]
    fn test_task_json_uses_loop_key() {
        let mut task = make_task("demo");
        task.looped = true;
        let json = serde_json::to_value(&task).expect("task should serialize");
        assert_eq!(json["loop"], serde_json::Value::Bool(true));
        assert_eq!(json["status"], "created");
        assert_eq!(json["hw_accel"], "auto");
    }

    #[test]
    fn test_patch_distinguishes_null_from_absent() {
        let patch: TaskPatch = serde_json::from_str(r#"{"bitrate_kbps": null}"#).unwrap();
        assert_eq!(patch.bitrate_kbps, Some(None));
        assert_eq!(patch.fps, None);

        let patch: TaskPatch = serde_json::from_str(r#"{"fps": 30}"#).unwrap();
        assert_eq!(patch.fps, Some(Some(30)));
        assert_eq!(patch.bitrate_kbps, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_normalized_path_shape(raw in "[ /a-zA-Z0-9\t_?#%-]{0,40}") {
            if let Some(path) = normalize_path(&raw) {
                prop_assert!(!path.is_empty());
                prop_assert!(!path.starts_with('/'));
                prop_assert!(path.chars().all(is_route_char));
                prop_assert_eq!(normalize_path(&path), Some(path.clone()));
            } else {
                prop_assert!(raw.chars().all(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace()));
            }
        }
    }
}
