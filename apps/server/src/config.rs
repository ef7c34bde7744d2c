//! Server configuration.
//!
//! Loaded from a YAML file with environment variable overrides. The same file
//! carries the speaker directory (speakers, groups and channel playlists).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use onair_core::{BootstrapOptions, Directory};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP/WS server to (0 = first free default port).
    /// Override: `ONAIR_BIND_PORT`
    pub bind_port: u16,

    /// Directory for persistent broadcast state.
    /// Override: `ONAIR_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Directory media filenames are resolved against.
    /// Override: `ONAIR_MEDIA_DIR`
    pub media_dir: PathBuf,

    /// Directory TTS filenames are resolved against. Defaults to `media_dir`.
    pub tts_dir: Option<PathBuf>,

    /// UDP port for speakers configured without one.
    /// Override: `ONAIR_SPEAKER_PORT`
    pub speaker_port: u16,

    /// Idle timeout for control connections (seconds).
    pub ws_heartbeat_timeout_secs: u64,

    /// Speakers, groups and channels.
    #[serde(flatten)]
    pub directory: Directory,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = onair_core::Config::default();
        Self {
            bind_port: 8765,
            data_dir: None,
            media_dir: PathBuf::from("media"),
            tts_dir: None,
            speaker_port: core.speaker_port,
            ws_heartbeat_timeout_secs: core.ws_heartbeat_timeout_secs,
            directory: Directory::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies overrides from an environment lookup.
    ///
    /// Unparseable values are ignored. `ONAIR_BIND_PORT` and `ONAIR_DATA_DIR`
    /// are also read by clap in main.rs, which wins over both file and env.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("ONAIR_BIND_PORT").and_then(|v| v.parse().ok()) {
            self.bind_port = port;
        }
        if let Some(dir) = var("ONAIR_DATA_DIR").filter(|v| !v.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = var("ONAIR_MEDIA_DIR").filter(|v| !v.is_empty()) {
            self.media_dir = PathBuf::from(dir);
        }
        if let Some(port) = var("ONAIR_SPEAKER_PORT").and_then(|v| v.parse().ok()) {
            self.speaker_port = port;
        }
    }

    /// Converts to onair-core's Config type.
    pub fn to_core_config(&self) -> onair_core::Config {
        onair_core::Config {
            bind_port: self.bind_port,
            speaker_port: self.speaker_port,
            ws_heartbeat_timeout_secs: self.ws_heartbeat_timeout_secs,
            ..Default::default()
        }
    }

    /// Service wiring options; consumes the directory.
    pub fn into_bootstrap_options(self) -> BootstrapOptions {
        let tts_dir = self.tts_dir.unwrap_or_else(|| self.media_dir.clone());
        BootstrapOptions {
            directory: self.directory,
            data_dir: self.data_dir,
            media_dir: self.media_dir,
            tts_dir,
        }
    }
}
