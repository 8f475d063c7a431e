//! relaycast daemon
//!
//! Supervises ffmpeg transcoding tasks that publish local media to an RTSP
//! relay server, plus the relay server process itself.

pub mod api_server;
pub mod binaries;
pub mod capabilities;
pub mod command;
pub mod daemon;
pub mod events;
pub mod logs;
pub mod process;
pub mod relay;
pub mod store;
pub mod supervisor;
pub mod task;

pub use relaycast_config as config;
pub use relaycast_config::{AppSettings, DaemonConfig, HwAccelPolicy, SettingsPatch};

pub use api_server::{create_api_router, run_api_server, ApiError, ServerError};
pub use binaries::{check_executable, BinaryError, BinaryResolver, BundledBinaries};
pub use capabilities::{
    parse_encoders, parse_hwaccels, CapabilityDetector, FfmpegCapabilities, HwBackend,
};
pub use command::{output_url, select_encoder, synthesize, CommandPlan, EncoderPolicy, SynthesisError};
pub use daemon::{Daemon, DaemonError};
pub use events::{Event, EventBus, LogOrigin};
pub use process::{ExitOutcome, ShutdownKind, STOP_GRACE};
pub use relay::{render_config, RelayError, RelaySupervisor, RtspServerStatus, ServerState};
pub use store::{StoreError, TaskStore};
pub use supervisor::{ProcessSupervisor, SupervisorError};
pub use task::{
    normalize_path, AudioCodec, CodecFamily, NewTask, StreamTask, TaskPatch, TaskStatus, Transport,
    VideoCodec,
};
