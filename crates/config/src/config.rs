//! Core configuration structures and loading logic

use crate::settings::AppSettings;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Filesystem locations used by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directory holding the persisted task/settings store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory for generated runtime files (relay config)
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Root of the bundled binaries, laid out as `<os>-<arch>/`
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,
    /// Explicit transcoder path, overrides `bin_dir` lookup
    #[serde(default)]
    pub ffmpeg: Option<PathBuf>,
    /// Explicit relay server path, overrides `bin_dir` lookup
    #[serde(default)]
    pub relay: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_runtime_dir() -> PathBuf {
    env::temp_dir().join("relaycast")
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("./bin")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            runtime_dir: default_runtime_dir(),
            bin_dir: default_bin_dir(),
            ffmpeg: None,
            relay: None,
        }
    }
}

/// HTTP control API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_api_enabled() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind_addr: default_bind_addr(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive (e.g. `info`, `relaycast=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DaemonConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Settings seeded into a fresh store
    #[serde(default)]
    pub defaults: AppSettings,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RELAYCAST_DATA_DIR -> paths.data_dir
    /// - RELAYCAST_RUNTIME_DIR -> paths.runtime_dir
    /// - RELAYCAST_BIN_DIR -> paths.bin_dir
    /// - RELAYCAST_FFMPEG -> paths.ffmpeg
    /// - RELAYCAST_RELAY -> paths.relay
    /// - RELAYCAST_API_ADDR -> api.bind_addr
    /// - RELAYCAST_LOG_LEVEL -> logging.level
    /// - RELAYCAST_LOG_FORMAT -> logging.format
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_path("RELAYCAST_DATA_DIR") {
            self.paths.data_dir = dir;
        }
        if let Some(dir) = env_path("RELAYCAST_RUNTIME_DIR") {
            self.paths.runtime_dir = dir;
        }
        if let Some(dir) = env_path("RELAYCAST_BIN_DIR") {
            self.paths.bin_dir = dir;
        }
        if let Some(path) = env_path("RELAYCAST_FFMPEG") {
            self.paths.ffmpeg = Some(path);
        }
        if let Some(path) = env_path("RELAYCAST_RELAY") {
            self.paths.relay = Some(path);
        }

        if let Ok(addr) = env::var("RELAYCAST_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.bind_addr = addr.trim().to_string();
            }
        }

        if let Ok(level) = env::var("RELAYCAST_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.logging.level = level.trim().to_string();
            }
        }

        // Accept "pretty", "compact", "json"; anything else keeps the existing value
        if let Ok(val) = env::var("RELAYCAST_LOG_FORMAT") {
            match val.to_lowercase().as_str() {
                "pretty" => self.logging.format = LogFormat::Pretty,
                "compact" => self.logging.format = LogFormat::Compact,
                "json" => self.logging.format = LogFormat::Json,
                _ => {}
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`DaemonConfig::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                DaemonConfig::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Location of the persisted store file
    pub fn store_path(&self) -> PathBuf {
        self.paths.data_dir.join("store.json")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}
