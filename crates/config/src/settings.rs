//! Process-wide application settings and their validation rules

use serde::{Deserialize, Serialize};

/// Hardware acceleration policy for video encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelPolicy {
    /// Pick the best backend the capability snapshot reports
    #[default]
    Auto,
    /// Software encoding only
    Cpu,
    /// NVIDIA NVENC
    Nvenc,
    /// Intel Quick Sync Video
    Qsv,
    /// Apple VideoToolbox
    #[serde(rename = "videotoolbox")]
    VideoToolbox,
}

impl HwAccelPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HwAccelPolicy::Auto => "auto",
            HwAccelPolicy::Cpu => "cpu",
            HwAccelPolicy::Nvenc => "nvenc",
            HwAccelPolicy::Qsv => "qsv",
            HwAccelPolicy::VideoToolbox => "videotoolbox",
        }
    }
}

impl std::fmt::Display for HwAccelPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when settings fail validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// Listen host is empty
    EmptyHost,
    /// Listen port outside 1-65535
    PortOutOfRange(u32),
    /// Auth is enabled but the username is empty
    EmptyUsername,
    /// Auth is enabled but the password is empty
    EmptyPassword,
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::EmptyHost => write!(f, "listen host must not be empty"),
            SettingsError::PortOutOfRange(port) => {
                write!(f, "listen port {} is outside 1-65535", port)
            }
            SettingsError::EmptyUsername => {
                write!(f, "username is required when authentication is enabled")
            }
            SettingsError::EmptyPassword => {
                write!(f, "password is required when authentication is enabled")
            }
        }
    }
}

impl std::error::Error for SettingsError {}

/// Settings shared by the relay server and every transcoding task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSettings {
    /// Relay listen host
    #[serde(default = "default_host")]
    pub host: String,
    /// Relay listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Require credentials to publish and read
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Policy applied to tasks whose own policy is `auto`
    #[serde(default)]
    pub default_hw_accel: HwAccelPolicy,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8554
}

fn default_username() -> String {
    "admin".to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_enabled: false,
            username: default_username(),
            password: String::new(),
            default_hw_accel: HwAccelPolicy::Auto,
        }
    }
}

impl AppSettings {
    /// Check the invariants every stored settings record must hold
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::EmptyHost);
        }
        if self.port == 0 {
            return Err(SettingsError::PortOutOfRange(0));
        }
        if self.auth_enabled {
            if self.username.trim().is_empty() {
                return Err(SettingsError::EmptyUsername);
            }
            if self.password.is_empty() {
                return Err(SettingsError::EmptyPassword);
            }
        }
        Ok(())
    }

    /// Apply a partial update and validate the result
    ///
    /// The receiver is left untouched when validation fails.
    pub fn apply(&self, patch: &SettingsPatch) -> Result<AppSettings, SettingsError> {
        let mut next = self.clone();
        if let Some(host) = &patch.host {
            next.host = host.trim().to_string();
        }
        if let Some(port) = patch.port {
            next.port = u16::try_from(port)
                .ok()
                .filter(|p| *p != 0)
                .ok_or(SettingsError::PortOutOfRange(port))?;
        }
        if let Some(enabled) = patch.auth_enabled {
            next.auth_enabled = enabled;
        }
        if let Some(username) = &patch.username {
            next.username = username.trim().to_string();
        }
        if let Some(password) = &patch.password {
            next.password = password.clone();
        }
        if let Some(policy) = patch.default_hw_accel {
            next.default_hw_accel = policy;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial settings update; `None` fields are left unchanged
///
/// `port` is wider than `u16` so out-of-range requests reach validation
/// instead of failing deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsPatch {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub auth_enabled: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub default_hw_accel: Option<HwAccelPolicy>,
}
