//! Values exchanged with the crypto key.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use zeroize::Zeroizing;

use super::protocol::{DIGEST_LEN, STATUS_OK, VERIFY_FAILED};
use crate::error::{CryptoKeyError, Result};

/// Shortest pin accepted by `set_pin`.
pub const MIN_PIN_LEN: usize = 4;
/// Longest pin accepted by `set_pin`.
pub const MAX_PIN_LEN: usize = 64;

/// Device pin. Wiped on drop; `Debug` never shows the contents.
#[derive(Clone)]
pub struct Pin(Zeroizing<Vec<u8>>);

impl Pin {
    /// Wrap an existing pin without validation.
    ///
    /// Used for handshakes, where the device is the only judge.
    pub fn new(pin: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(pin.into()))
    }

    /// Check the length bound enforced before a pin is written to the device.
    pub fn validate(&self) -> Result<()> {
        let len = self.0.len();
        if len < MIN_PIN_LEN {
            return Err(CryptoKeyError::invalid_pin(format!(
                "must be at least {MIN_PIN_LEN} bytes, got {len}"
            )));
        }
        if len > MAX_PIN_LEN {
            return Err(CryptoKeyError::invalid_pin(format!(
                "must be at most {MAX_PIN_LEN} bytes, got {len}"
            )));
        }
        Ok(())
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

/// SHA-256 digest computed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// DER-encoded ECDSA signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// SEC1-encoded ECDSA public key.
///
/// Firmware generations differ in which form they return, so the form is
/// always taken from the prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicKey {
    /// 0x02/0x03 prefix, 33 bytes.
    Compressed([u8; 33]),
    /// 0x04 prefix, 65 bytes.
    Uncompressed([u8; 65]),
}

impl PublicKey {
    /// Total encoded length implied by a SEC1 prefix byte.
    pub fn encoded_len(prefix: u8) -> Option<usize> {
        match prefix {
            0x02 | 0x03 => Some(33),
            0x04 => Some(65),
            _ => None,
        }
    }

    /// Parse a key, checking that prefix and length agree.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let prefix = *bytes
            .first()
            .ok_or_else(|| CryptoKeyError::malformed("empty public key"))?;
        match (Self::encoded_len(prefix), bytes.len()) {
            (Some(33), 33) => {
                let mut key = [0u8; 33];
                key.copy_from_slice(bytes);
                Ok(Self::Compressed(key))
            }
            (Some(65), 65) => {
                let mut key = [0u8; 65];
                key.copy_from_slice(bytes);
                Ok(Self::Uncompressed(key))
            }
            (Some(expected), actual) => Err(CryptoKeyError::malformed(format!(
                "public key prefix {prefix:#04x} implies {expected} bytes, got {actual}"
            ))),
            (None, _) => Err(CryptoKeyError::malformed(format!(
                "unknown public key prefix {prefix:#04x}"
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Compressed(key) => key,
            Self::Uncompressed(key) => key,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

/// Outcome of a device-side `verify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Verified,
    /// The triple is well formed but the signature does not match.
    NotVerified,
    /// Any other status; usually malformed input.
    DeviceError(u32),
}

impl VerifyStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            STATUS_OK => Self::Verified,
            VERIFY_FAILED => Self::NotVerified,
            other => Self::DeviceError(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Verified => STATUS_OK,
            Self::NotVerified => VERIFY_FAILED,
            Self::DeviceError(code) => *code,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

impl fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => write!(f, "verified"),
            Self::NotVerified => write!(f, "signature did not verify"),
            Self::DeviceError(code) => write!(f, "device error {code:#010x} ({})", *code as i32),
        }
    }
}

/// Firmware version and clock reported by `info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: String,
    pub device_time: DateTime<Utc>,
}

impl DeviceInfo {
    /// How far the host clock is ahead of the device clock.
    pub fn skew_from(&self, host_now: DateTime<Utc>) -> TimeDelta {
        host_now - self.device_time
    }
}
