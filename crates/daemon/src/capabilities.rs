//! Transcoder capability detection
//!
//! Probes the ffmpeg binary for its encoder and hardware acceleration lists
//! and caches the resulting snapshot until a forced re-scan.

use crate::binaries::{check_executable, BinaryResolver};
use crate::task::CodecFamily;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Upper bound for each capability listing invocation
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Header preceding the method names in `ffmpeg -hwaccels` output
const HWACCELS_HEADER: &str = "Hardware acceleration methods:";

/// Hardware encoding backends, in automatic fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwBackend {
    Nvenc,
    Qsv,
    #[serde(rename = "videotoolbox")]
    VideoToolbox,
}

impl HwBackend {
    pub const FALLBACK_ORDER: [HwBackend; 3] =
        [HwBackend::Nvenc, HwBackend::Qsv, HwBackend::VideoToolbox];

    pub fn as_str(&self) -> &'static str {
        match self {
            HwBackend::Nvenc => "nvenc",
            HwBackend::Qsv => "qsv",
            HwBackend::VideoToolbox => "videotoolbox",
        }
    }

    /// ffmpeg encoder name for this backend, e.g. `hevc_qsv`
    pub fn encoder_name(&self, family: CodecFamily) -> String {
        format!("{}_{}", family.as_str(), self.as_str())
    }
}

/// Software encoder name for a codec family
pub fn software_encoder(family: CodecFamily) -> &'static str {
    match family {
        CodecFamily::H264 => "libx264",
        CodecFamily::Hevc => "libx265",
    }
}

/// Point-in-time snapshot of what the transcoder binary supports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FfmpegCapabilities {
    pub available: bool,
    pub binary_path: PathBuf,
    pub encoders: Vec<String>,
    pub hwaccels: Vec<String>,
    /// Why the probe failed, when `available` is false
    pub error: Option<String>,
    pub h264_nvenc: bool,
    pub hevc_nvenc: bool,
    pub h264_qsv: bool,
    pub hevc_qsv: bool,
    pub h264_videotoolbox: bool,
    pub hevc_videotoolbox: bool,
}

impl FfmpegCapabilities {
    /// Snapshot for a binary that could not be probed
    pub fn unavailable(binary_path: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        Self {
            available: false,
            binary_path: binary_path.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Build a snapshot from parsed listings, deriving the backend flags
    pub fn from_listings(
        binary_path: impl Into<PathBuf>,
        encoders: Vec<String>,
        hwaccels: Vec<String>,
    ) -> Self {
        let has = |name: &str| encoders.iter().any(|e| e == name);

        Self {
            available: true,
            binary_path: binary_path.into(),
            h264_nvenc: has("h264_nvenc"),
            hevc_nvenc: has("hevc_nvenc"),
            h264_qsv: has("h264_qsv"),
            hevc_qsv: has("hevc_qsv"),
            h264_videotoolbox: has("h264_videotoolbox"),
            hevc_videotoolbox: has("hevc_videotoolbox"),
            encoders,
            hwaccels,
            error: None,
        }
    }

    /// Whether `backend` can encode `family` on this machine
    pub fn supports(&self, backend: HwBackend, family: CodecFamily) -> bool {
        match (backend, family) {
            (HwBackend::Nvenc, CodecFamily::H264) => self.h264_nvenc,
            (HwBackend::Nvenc, CodecFamily::Hevc) => self.hevc_nvenc,
            (HwBackend::Qsv, CodecFamily::H264) => self.h264_qsv,
            (HwBackend::Qsv, CodecFamily::Hevc) => self.hevc_qsv,
            (HwBackend::VideoToolbox, CodecFamily::H264) => self.h264_videotoolbox,
            (HwBackend::VideoToolbox, CodecFamily::Hevc) => self.hevc_videotoolbox,
        }
    }
}

/// Parse encoder names from `ffmpeg -encoders` output
///
/// Listing lines start with a six-character flag column (e.g. `V....D`)
/// followed by the encoder name; legend and header lines are skipped.
pub fn parse_encoders(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;

            let is_flag_column = flags.len() == 6
                && matches!(flags.as_bytes()[0], b'V' | b'A' | b'S')
                && flags.chars().all(|c| c.is_ascii_uppercase() || c == '.');
            if is_flag_column && name != "=" {
                Some(name.to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Parse method names from `ffmpeg -hwaccels` output
///
/// Only lines after the header are considered.
pub fn parse_hwaccels(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| line.trim() != HWACCELS_HEADER)
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Probes the transcoder and caches the snapshot
pub struct CapabilityDetector {
    binaries: Arc<dyn BinaryResolver>,
    cache: RwLock<Option<Arc<FfmpegCapabilities>>>,
    scan_lock: Mutex<()>,
    probe_timeout: Duration,
}

impl CapabilityDetector {
    pub fn new(binaries: Arc<dyn BinaryResolver>) -> Self {
        Self {
            binaries,
            cache: RwLock::new(None),
            scan_lock: Mutex::new(()),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Cached snapshot without probing
    pub async fn cached(&self) -> Option<Arc<FfmpegCapabilities>> {
        self.cache.read().await.clone()
    }

    /// Return the cached snapshot, probing only when forced or nothing is cached
    ///
    /// Failed probes are cached as unavailable snapshots too, so a broken
    /// binary is not re-probed until a forced scan.
    pub async fn scan(&self, force: bool) -> Arc<FfmpegCapabilities> {
        if !force {
            if let Some(snapshot) = self.cached().await {
                return snapshot;
            }
        }

        let _guard = self.scan_lock.lock().await;
        if !force {
            // Another caller may have finished a scan while we waited
            if let Some(snapshot) = self.cached().await {
                return snapshot;
            }
        }

        let snapshot = Arc::new(self.probe().await);
        *self.cache.write().await = Some(snapshot.clone());
        snapshot
    }

    async fn probe(&self) -> FfmpegCapabilities {
        let path = self.binaries.transcoder();
        self.binaries.ensure_executable(&path);

        if let Err(e) = check_executable(&path) {
            warn!(path = %path.display(), error = %e, "transcoder unavailable");
            return FfmpegCapabilities::unavailable(&path, e.to_string());
        }

        let (encoders, hwaccels) = tokio::join!(
            run_listing(&path, "-encoders", self.probe_timeout),
            run_listing(&path, "-hwaccels", self.probe_timeout),
        );

        match (encoders, hwaccels) {
            (Ok(encoders), Ok(hwaccels)) => {
                let snapshot = FfmpegCapabilities::from_listings(
                    &path,
                    parse_encoders(&encoders),
                    parse_hwaccels(&hwaccels),
                );
                info!(
                    path = %path.display(),
                    encoders = snapshot.encoders.len(),
                    hwaccels = ?snapshot.hwaccels,
                    nvenc = snapshot.h264_nvenc || snapshot.hevc_nvenc,
                    qsv = snapshot.h264_qsv || snapshot.hevc_qsv,
                    videotoolbox = snapshot.h264_videotoolbox || snapshot.hevc_videotoolbox,
                    "transcoder capabilities detected"
                );
                snapshot
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(path = %path.display(), error = %e, "capability probe failed");
                FfmpegCapabilities::unavailable(&path, e)
            }
        }
    }
}

/// Run `<binary> -hide_banner <flag>` and return its stdout
async fn run_listing(binary: &Path, flag: &str, limit: Duration) -> Result<String, String> {
    let output = Command::new(binary)
        .arg("-hide_banner")
        .arg(flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(limit, output).await {
        Ok(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Err(e)) => Err(format!("failed to run {} {}: {}", binary.display(), flag, e)),
        Err(_) => Err(format!(
            "{} {} timed out after {}s",
            binary.display(),
            flag,
            limit.as_secs_f32()
        )),
    }
}
