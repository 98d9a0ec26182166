//! Time-windowed challenge/response checks.
//!
//! The device signs `sha256(challenge || window)`, where `window` is its
//! clock floored to the window length, as a u64 LE. Host and device compute
//! the window independently. Accepting preceding windows covers clock drift
//! and bounds how long a captured response stays valid.

use chrono::{DateTime, Utc};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature as EcdsaSignature, VerifyingKey};
use sha2::{Digest as _, Sha256};
use tracing::debug;

use super::types::{PublicKey, Signature};
use crate::config::ConfigError;
use crate::error::{CryptoKeyError, Result};

/// Window length used by the firmware.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;
/// Preceding windows accepted by default.
pub const DEFAULT_TOLERANCE_WINDOWS: u32 = 1;

/// Start of the window containing `epoch_ms`.
///
/// A zero-length window leaves `epoch_ms` unchanged.
pub fn window_start(epoch_ms: u64, window_ms: u64) -> u64 {
    epoch_ms - epoch_ms.checked_rem(window_ms).unwrap_or(0)
}

/// Bytes the device hashes and signs for an auth response.
pub fn signed_message(challenge: &[u8], window: u64) -> Vec<u8> {
    let mut message = Vec::with_capacity(challenge.len() + 8);
    message.extend_from_slice(challenge);
    message.extend_from_slice(&window.to_le_bytes());
    message
}

/// Host-side acceptance policy for auth responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    window_ms: u64,
    tolerance_windows: u32,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            tolerance_windows: DEFAULT_TOLERANCE_WINDOWS,
        }
    }
}

impl AuthPolicy {
    /// Policy accepting the current window and `tolerance_windows` before it.
    ///
    /// # Errors
    /// `Config` if `window_ms` is zero.
    pub fn new(window_ms: u64, tolerance_windows: u32) -> Result<Self> {
        if window_ms == 0 {
            return Err(ConfigError::Validation("Auth window must be greater than 0".to_string()).into());
        }
        Ok(Self {
            window_ms,
            tolerance_windows,
        })
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// How many windows before the current one still verify.
    pub fn tolerance_windows(&self) -> u32 {
        self.tolerance_windows
    }

    /// Window containing `time`. Times before the epoch map to window 0.
    pub fn window_at(&self, time: DateTime<Utc>) -> u64 {
        let millis = u64::try_from(time.timestamp_millis()).unwrap_or(0);
        window_start(millis, self.window_ms)
    }

    /// Windows accepted at `now`, newest first.
    pub fn accepted_windows(&self, now: DateTime<Utc>) -> Vec<u64> {
        let current = self.window_at(now);
        (0..=u64::from(self.tolerance_windows))
            .map_while(|step| {
                step.checked_mul(self.window_ms)
                    .and_then(|offset| current.checked_sub(offset))
            })
            .collect()
    }

    /// Check an auth response at `now`.
    ///
    /// Returns the matching window, or `None` if the signature is valid for
    /// none of the accepted windows.
    ///
    /// # Errors
    /// `Malformed` if the key or signature cannot be decoded.
    pub fn verify(
        &self,
        public_key: &PublicKey,
        challenge: &[u8],
        signature: &Signature,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        let key = decode_key(public_key)?;
        let signature = decode_signature(signature)?;
        let matched = self
            .accepted_windows(now)
            .into_iter()
            .find(|&window| verify_parsed(&key, &signature, challenge, window));
        debug!("Auth response matched window {matched:?}");
        Ok(matched)
    }
}

/// Check an auth response against one specific window.
pub fn verify_window(public_key: &PublicKey, challenge: &[u8], signature: &Signature, window: u64) -> Result<bool> {
    let key = decode_key(public_key)?;
    let signature = decode_signature(signature)?;
    Ok(verify_parsed(&key, &signature, challenge, window))
}

fn verify_parsed(key: &VerifyingKey, signature: &EcdsaSignature, challenge: &[u8], window: u64) -> bool {
    let digest = Sha256::digest(signed_message(challenge, window));
    key.verify_prehash(&digest, signature).is_ok()
}

fn decode_key(public_key: &PublicKey) -> Result<VerifyingKey> {
    VerifyingKey::from_sec1_bytes(public_key.as_bytes())
        .map_err(|e| CryptoKeyError::malformed(format!("public key is not a secp256k1 point: {e}")))
}

fn decode_signature(signature: &Signature) -> Result<EcdsaSignature> {
    let parsed = EcdsaSignature::from_der(signature.as_bytes())
        .map_err(|e| CryptoKeyError::malformed(format!("signature is not DER ECDSA: {e}")))?;
    // The firmware does not normalize S; k256 only accepts low-S.
    Ok(parsed.normalize_s().unwrap_or(parsed))
}
