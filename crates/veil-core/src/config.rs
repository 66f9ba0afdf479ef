//! Configuration for the veil daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VEIL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/veil/config.toml
//!   3. ~/.config/veil/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest dump page the daemon accepts. Must hold the device fields.
pub const MIN_MESSAGE_SIZE: usize = 256;
/// Attribute lengths are 16-bit, so no message may exceed this.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    pub control: ControlConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Unix socket the control protocol is served on.
    pub socket_path: PathBuf,
    /// Byte budget of a single dump reply message.
    pub max_message_size: usize,
}

/// A device created when the daemon starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    /// UDP listen port. 0 = pick one when the device comes up.
    pub listen_port: u16,
    pub fwmark: u32,
    /// File holding the hex-encoded private key. Unset = no identity.
    pub private_key_path: Option<PathBuf>,
    /// Bring the device up (bind its socket) on start.
    pub up: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: runtime_dir().join("control.sock"),
            max_message_size: 8192,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "wg0".to_string(),
            listen_port: 0,
            fwmark: 0,
            private_key_path: None,
            up: true,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("veil")
}

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run"))
        .join("veil")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("max_message_size {0} outside {}..={}", MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE)]
    MessageSize(usize),
    #[error("device name {0:?} must be 1 to 15 bytes")]
    DeviceName(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VeilConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            VeilConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VEIL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&VeilConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.control.max_message_size;
        if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&size) {
            return Err(ConfigError::MessageSize(size));
        }
        for device in &self.devices {
            if device.name.is_empty() || device.name.len() >= crate::schema::IFNAMSIZ {
                return Err(ConfigError::DeviceName(device.name.clone()));
            }
        }
        Ok(())
    }

    /// Apply VEIL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VEIL_CONTROL__SOCKET_PATH") {
            self.control.socket_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VEIL_CONTROL__MAX_MESSAGE_SIZE") {
            if let Ok(n) = v.parse() {
                self.control.max_message_size = n;
            }
        }
    }
}
