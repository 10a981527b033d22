//! Configuration management for the video bridge
//!
//! Values come from an optional TOML file; the binary then applies command
//! line overrides and calls [`Config::validate`] once more.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

/// WebSocket listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest WebSocket message accepted or sent (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Where JPEG encoding happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodeMode {
    /// `jpegenc` inside the GStreamer pipeline
    #[default]
    Pipeline,
    /// RGB appsink, encoded by the producer with the `image` crate
    InProcess,
}

/// Upstream multicast H.264 stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Network interface joined to the multicast group
    #[serde(default)]
    pub interface: String,

    #[serde(default = "default_multicast_address")]
    pub multicast_address: String,

    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,

    /// Nominal source resolution, used with `scale`
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Output scale factor, 0 < scale <= 1
    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub encode: EncodeMode,
}

impl SourceConfig {
    /// Output resolution after scaling, or `None` when no rescale is needed
    pub fn scaled_dimensions(&self) -> Option<(u32, u32)> {
        if self.scale >= 1.0 {
            return None;
        }
        // Even sizes keep I420 conversion happy
        let scale = |v: u32| (((v as f64 * self.scale) as u32) & !1).max(2);
        Some((scale(self.width), scale(self.height)))
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            multicast_address: default_multicast_address(),
            multicast_port: default_multicast_port(),
            width: default_width(),
            height: default_height(),
            quality: default_quality(),
            scale: default_scale(),
            encode: EncodeMode::default(),
        }
    }
}

/// Distribution tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upper bound on a session's wait for a new frame (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,

    #[serde(default = "default_status_send_timeout")]
    pub status_send_timeout_ms: u64,

    /// Number of frame timestamps kept for the FPS estimate
    #[serde(default = "default_fps_window")]
    pub fps_window: usize,

    /// Producer stats line cadence in frames (0 disables)
    #[serde(default = "default_log_every_frames")]
    pub log_every_frames: u64,

    /// How long shutdown waits for sessions to finish (ms)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            status_interval_ms: default_status_interval(),
            status_send_timeout_ms: default_status_send_timeout(),
            fps_window: default_fps_window(),
            log_every_frames: default_log_every_frames(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_max_message_size() -> usize {
    5 * 1024 * 1024
}
fn default_multicast_address() -> String {
    "230.1.1.1".to_string()
}
fn default_multicast_port() -> u16 {
    1720
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_quality() -> u8 {
    50
}
fn default_scale() -> f64 {
    1.0
}
fn default_poll_interval() -> u64 {
    5
}
fn default_status_interval() -> u64 {
    1000
}
fn default_status_send_timeout() -> u64 {
    2000
}
fn default_fps_window() -> usize {
    30
}
fn default_log_every_frames() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    2000
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// Not validated here: the interface is usually supplied on the command
    /// line afterwards.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses a TOML string without validating it
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let source = &self.source;

        if source.interface.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "source.interface must be set (e.g. --interface eth0)".to_string(),
            ));
        }

        if source.quality == 0 || source.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "quality must be between 1 and 100, got {}",
                source.quality
            )));
        }

        if !(source.scale > 0.0 && source.scale <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "scale must be in (0, 1], got {}",
                source.scale
            )));
        }

        if source.width == 0 || source.height == 0 {
            return Err(ConfigError::Invalid(
                "source width and height must be > 0".to_string(),
            ));
        }

        if source.multicast_port == 0 {
            return Err(ConfigError::Invalid("multicast_port must be > 0".to_string()));
        }

        if self.server.port == 0 {
            return Err(ConfigError::Invalid("port must be > 0".to_string()));
        }

        let relay = &self.relay;

        if relay.fps_window < 2 {
            return Err(ConfigError::Invalid(format!(
                "fps_window must be at least 2, got {}",
                relay.fps_window
            )));
        }

        if relay.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }

        if relay.status_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "status_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Saves configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
