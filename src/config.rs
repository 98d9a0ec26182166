//! Configuration management module.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::token::{AuthPolicy, MAX_CHUNK_SIZE, SessionOptions};

/// Configuration load result.
#[derive(Debug)]
pub enum ConfigLoadResult {
    /// Config loaded successfully.
    Loaded(AppConfig),
    /// Config file missing (first run).
    Missing,
    /// Config file exists but invalid.
    Invalid(ConfigError),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Serial device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial device node (default: /dev/ttyACM0).
    #[serde(default = "default_device_path")]
    pub path: String,
    /// Line rate; ignored by CDC-ACM but required to open the port.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// OS read timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the pin.
    #[serde(default = "default_pin_env")]
    pub pin_env: String,
}

/// Framing parameters agreed with the firmware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Payload chunk size in bytes (default: 2048).
    ///
    /// Must equal the firmware chunk for encrypt and decrypt, which answer
    /// only after a full device chunk arrives.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest length-prefixed response accepted from the device.
    #[serde(default = "default_max_response_len")]
    pub max_response_len: usize,
}

/// Host-side policy for time-windowed auth responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Window length in milliseconds (default: 60000).
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Preceding windows still accepted (default: 1).
    #[serde(default = "default_tolerance_windows")]
    pub tolerance_windows: u32,
}

fn default_device_path() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_pin_env() -> String {
    "PICO_CRYPTO_KEY_PIN".to_string()
}

fn default_chunk_size() -> usize {
    2048
}

fn default_max_response_len() -> usize {
    64 * 1024
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_tolerance_windows() -> u32 {
    1
}

impl AppConfig {
    /// Get config file path (platform config directory).
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "pico-crypto-key")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Attempt to load config with detailed result.
    pub fn try_load(path: &Path) -> ConfigLoadResult {
        if !path.exists() {
            return ConfigLoadResult::Missing;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<AppConfig>(&content) {
                Ok(config) => match config.validate() {
                    Ok(()) => ConfigLoadResult::Loaded(config),
                    Err(e) => ConfigLoadResult::Invalid(e),
                },
                Err(e) => ConfigLoadResult::Invalid(ConfigError::Parse(e)),
            },
            Err(e) => ConfigLoadResult::Invalid(ConfigError::Read(e)),
        }
    }

    /// Load config, falling back to defaults when the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::try_load(path) {
            ConfigLoadResult::Loaded(config) => Ok(config),
            ConfigLoadResult::Missing => Ok(Self::default()),
            ConfigLoadResult::Invalid(e) => Err(e),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.path.trim().is_empty() {
            return Err(ConfigError::Validation("Device path cannot be empty".to_string()));
        }
        if self.device.pin_env.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Pin environment variable name cannot be empty".to_string(),
            ));
        }
        if self.transport.chunk_size == 0 {
            return Err(ConfigError::Validation("Chunk size must be greater than 0".to_string()));
        }
        if self.transport.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Validation(format!(
                "Chunk size cannot exceed {MAX_CHUNK_SIZE} bytes"
            )));
        }
        if self.transport.max_response_len < 1024 {
            return Err(ConfigError::Validation(
                "Max response length must be at least 1024 bytes".to_string(),
            ));
        }
        if self.auth.window_ms == 0 {
            return Err(ConfigError::Validation("Auth window must be greater than 0".to_string()));
        }
        if self.auth.tolerance_windows > 5 {
            return Err(ConfigError::Validation(
                "Auth tolerance cannot exceed 5 windows".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Framing options for a new session.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            chunk_size: self.transport.chunk_size,
            max_response_len: self.transport.max_response_len,
        }
    }

    /// Verification policy for auth responses.
    pub fn auth_policy(&self) -> crate::Result<AuthPolicy> {
        AuthPolicy::new(self.auth.window_ms, self.auth.tolerance_windows)
    }
}

impl DeviceConfig {
    /// Read timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: default_device_path(),
            baud_rate: default_baud_rate(),
            timeout_secs: default_timeout_secs(),
            pin_env: default_pin_env(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_response_len: default_max_response_len(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            tolerance_windows: default_tolerance_windows(),
        }
    }
}
