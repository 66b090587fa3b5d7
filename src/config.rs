//! Application configuration
//!
//! Protocol constants live in [`ProtocolConfig`] and are handed to the codec,
//! session and receiver at construction. Timeouts are expressed in
//! milliseconds in the config file and exposed as [`Duration`] accessors.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wire protocol and timing parameters shared by both endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Two magic bytes identifying the protocol on the wire ("WM").
    pub magic: [u8; 2],

    /// Protocol version byte.
    pub version: u8,

    /// Well-known UDP port the receiving host listens on.
    pub port: u16,

    /// mDNS service type the receiving host advertises under.
    pub service_type: String,

    /// How long a connect waits for the handshake response.
    pub handshake_timeout_ms: u64,

    /// Maximum silence before a connected session is declared lost.
    pub heartbeat_timeout_ms: u64,

    /// Period of the orchestrator's keepalive timer.
    pub keepalive_interval_ms: u64,

    /// Minimum spacing between acks the receiver sends during audio.
    pub ack_throttle_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            magic: *b"WM",
            version: 1,
            port: 48888,
            service_type: "_meomic._udp.local.".to_string(),
            handshake_timeout_ms: 3000,
            heartbeat_timeout_ms: 5000,
            keepalive_interval_ms: 1000,
            ack_throttle_ms: 500,
        }
    }
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn ack_throttle(&self) -> Duration {
        Duration::from_millis(self.ack_throttle_ms)
    }
}

/// Audio capture parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,

    /// Channel count. The wire format carries mono PCM.
    pub channels: u16,

    /// Capture chunk length in milliseconds.
    pub chunk_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channels: crate::constants::DEFAULT_CHANNELS,
            chunk_ms: crate::constants::DEFAULT_CHUNK_MS,
        }
    }
}

impl AudioConfig {
    /// Samples per capture chunk.
    pub fn chunk_samples(&self) -> usize {
        (self.sample_rate as usize * self.chunk_ms as usize) / 1000
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub protocol: ProtocolConfig,
    pub audio: AudioConfig,
}

impl AppConfig {
    /// Path of the user config file, if a home directory can be determined.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "netmic").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist. A file that exists but fails to parse is an error.
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)?;
                toml::from_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
            }
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_defaults() {
        let cfg = ProtocolConfig::default();
        assert_eq!(&cfg.magic, b"WM");
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.port, 48888);
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.keepalive_interval(), Duration::from_secs(1));
    }

    #[test]
    fn chunk_samples_at_48k() {
        let cfg = AudioConfig::default();
        assert_eq!(cfg.sample_rate, 48000);
        assert_eq!(cfg.chunk_samples(), 480);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str("[protocol]\nport = 50000\n").unwrap();
        assert_eq!(cfg.protocol.port, 50000);
        assert_eq!(&cfg.protocol.magic, b"WM");
        assert_eq!(cfg.audio.sample_rate, 48000);
    }
}
