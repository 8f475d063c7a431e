//! Location and sanity checks for the external executables.

use relaycast_config::PathsConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for binary checks
#[derive(Debug, Error)]
pub enum BinaryError {
    #[error("binary not found at {0}")]
    Missing(PathBuf),

    #[error("binary at {0} is not executable")]
    NotExecutable(PathBuf),
}

/// Resolves absolute paths to the transcoder and relay executables
pub trait BinaryResolver: Send + Sync {
    fn transcoder(&self) -> PathBuf;

    fn relay(&self) -> PathBuf;

    /// Best-effort attempt to mark a bundled binary executable.
    ///
    /// Must not fail on platforms without permission bits.
    fn ensure_executable(&self, path: &Path) {
        ensure_executable(path)
    }
}

/// Default resolver: explicit config paths win, otherwise binaries are looked
/// up under `<bin_dir>/<os>-<arch>/`
#[derive(Debug, Clone)]
pub struct BundledBinaries {
    bin_dir: PathBuf,
    transcoder: Option<PathBuf>,
    relay: Option<PathBuf>,
}

impl BundledBinaries {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            transcoder: None,
            relay: None,
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self {
            bin_dir: paths.bin_dir.clone(),
            transcoder: paths.ffmpeg.clone(),
            relay: paths.relay.clone(),
        }
    }

    pub fn with_transcoder(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcoder = Some(path.into());
        self
    }

    pub fn with_relay(mut self, path: impl Into<PathBuf>) -> Self {
        self.relay = Some(path.into());
        self
    }

    fn platform_dir(&self) -> PathBuf {
        self.bin_dir
            .join(format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH))
    }
}

impl BinaryResolver for BundledBinaries {
    fn transcoder(&self) -> PathBuf {
        self.transcoder
            .clone()
            .unwrap_or_else(|| self.platform_dir().join(executable_name("ffmpeg")))
    }

    fn relay(&self) -> PathBuf {
        self.relay
            .clone()
            .unwrap_or_else(|| self.platform_dir().join(executable_name("mediamtx")))
    }
}

fn executable_name(stem: &str) -> String {
    format!("{}{}", stem, std::env::consts::EXE_SUFFIX)
}

/// Check that `path` is an existing file that can be executed
pub fn check_executable(path: &Path) -> Result<(), BinaryError> {
    let metadata = std::fs::metadata(path).map_err(|_| BinaryError::Missing(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(BinaryError::Missing(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(BinaryError::NotExecutable(path.to_path_buf()));
        }
    }

    Ok(())
}

/// Add execute bits to a file; silently ignores failures and non-unix targets
pub fn ensure_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mut perms = metadata.permissions();
            let mode = perms.mode();
            if mode & 0o111 != 0o111 {
                perms.set_mode(mode | 0o755);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::debug!(path = %path.display(), error = %e, "could not set execute permission");
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = path;
}
