//! Configuration crate for relaycast
//!
//! Handles loading the daemon configuration from TOML files with environment
//! variable overrides, and defines the validated application settings.

pub mod config;
pub mod settings;

pub use config::*;
pub use settings::{AppSettings, HwAccelPolicy, SettingsError, SettingsPatch};
