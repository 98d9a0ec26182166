//! Host driver for the serial crypto key.
//!
//! Opens the device, authenticates with a pin and exposes hashing, signing,
//! verification, encryption and relying-party auth as typed operations.

mod auth;
mod commands;
mod protocol;
mod session;
mod transport;
mod types;

#[cfg(test)]
mod mock;

// Re-export public API
pub use auth::{AuthPolicy, DEFAULT_TOLERANCE_WINDOWS, DEFAULT_WINDOW_MS, signed_message, verify_window, window_start};
pub use protocol::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, VERIFY_FAILED};
pub use session::{Session, SessionOptions, SessionState};
pub use transport::{ClaimGuard, DeviceClaim, NoClaim, SerialTransport, Transport, locate};
pub use types::{DeviceInfo, Digest, MAX_PIN_LEN, MIN_PIN_LEN, Pin, PublicKey, Signature, VerifyStatus};
