//! Error types and handling.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while talking to the crypto key.
///
/// A failed signature check is not an error; see [`crate::token::VerifyStatus`].
#[derive(Error, Debug)]
pub enum CryptoKeyError {
    /// Device absent when connecting
    #[error("Crypto key not found: {0}")]
    NotFound(String),

    /// Pin rejected during the handshake
    #[error("Pin incorrect (device status {0})")]
    Auth(u32),

    /// Pin rejected on the host before anything was sent
    #[error("Invalid pin: {0}")]
    InvalidPin(String),

    /// Short read/write, bad length or response desynchronization
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Nonzero status returned by the device
    #[error("Device error: status {0:#010x}")]
    DeviceInternal(u32),

    /// Key or signature bytes that cannot be decoded on the host
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Transport I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for CryptoKeyError
pub type Result<T> = std::result::Result<T, CryptoKeyError>;

impl CryptoKeyError {
    /// Create a not found error with message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a protocol error with message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid pin error with message
    pub fn invalid_pin(msg: impl Into<String>) -> Self {
        Self::InvalidPin(msg.into())
    }

    /// Create a malformed input error with message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Whether the error leaves the byte stream in an unknown position.
    ///
    /// The session is torn down after any of these.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Io(_))
    }
}
