//! Session lifecycle: handshake, readiness guard and teardown.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::protocol::{CMD_END_SESSION, DEFAULT_CHUNK_SIZE, Framer, STATUS_OK};
use super::transport::{ClaimGuard, DeviceClaim, NoClaim, SerialTransport, Transport, locate};
use super::types::Pin;
use crate::config::AppConfig;
use crate::error::{CryptoKeyError, Result};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Torn down, or waiting for a pin.
    Disconnected,
    /// Pin sent, status not yet read.
    Handshaking,
    /// Pin accepted; commands may be issued.
    Ready,
}

/// Framing parameters for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub chunk_size: usize,
    pub max_response_len: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_response_len: 64 * 1024,
        }
    }
}

/// Authenticated connection to one crypto key.
///
/// Only [`Session::connect`] and [`Session::open`] create sessions, and both
/// return only after the pin is accepted. Commands block until the device
/// answers; the protocol has no request IDs, so a session must not be shared
/// between threads without external locking.
///
/// Dropping the session ends it on the device, closes the transport and
/// releases any platform claim.
pub struct Session<T: Transport> {
    framer: Framer<T>,
    pin: Pin,
    state: SessionState,
    claim: Option<ClaimGuard>,
}

impl Session<SerialTransport> {
    /// Open the configured serial device and handshake with `pin`.
    pub fn open(config: &AppConfig, pin: Pin) -> Result<Self> {
        Self::open_with_claim(config, pin, Box::new(NoClaim))
    }

    /// As [`Session::open`], taking the device from its platform driver first.
    pub fn open_with_claim(config: &AppConfig, pin: Pin, claim: Box<dyn DeviceClaim + Send>) -> Result<Self> {
        let path = Path::new(&config.device.path);
        locate(path)?;
        let guard = ClaimGuard::acquire(claim, path)?;
        let transport = SerialTransport::open(path, config.device.baud_rate, config.device.timeout())?;
        Session::connect_claimed(transport, Some(guard), pin, config.session_options())
    }
}

impl<T: Transport> Session<T> {
    /// Handshake over an already open transport.
    ///
    /// # Errors
    /// `Auth` if the device rejects the pin. The transport is closed on any
    /// failure.
    pub fn connect(transport: T, pin: Pin, options: SessionOptions) -> Result<Self> {
        Self::connect_claimed(transport, None, pin, options)
    }

    /// Handshake, holding `claim` for the lifetime of the session.
    pub fn connect_claimed(
        transport: T,
        claim: Option<ClaimGuard>,
        pin: Pin,
        options: SessionOptions,
    ) -> Result<Self> {
        let mut session = Self {
            framer: Framer::new(transport, options.chunk_size, options.max_response_len),
            pin,
            state: SessionState::Disconnected,
            claim,
        };
        debug!("Connecting with chunk size {}", session.framer.chunk_size());
        // On error the session drops here, which closes the transport.
        session.handshake()?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// End the device session and handshake again with the stored pin.
    pub fn reconnect(&mut self) -> Result<()> {
        self.ensure_ready();
        self.end_session()?;
        self.handshake()
    }

    /// End the session and release the device, reporting any failure.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    /// Run one command. Errors that desynchronize the stream tear the session down.
    pub(crate) fn run<R>(&mut self, op: impl FnOnce(&mut Framer<T>) -> Result<R>) -> Result<R> {
        self.ensure_ready();
        match op(&mut self.framer) {
            Ok(value) => Ok(value),
            Err(e) if e.is_fatal_to_session() => {
                warn!("Tearing down session after error: {e}");
                self.state = SessionState::Disconnected;
                if let Err(close_err) = self.teardown() {
                    warn!("Teardown after error failed: {close_err}");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn replace_pin(&mut self, pin: Pin) {
        self.pin = pin;
    }

    fn ensure_ready(&self) {
        assert_eq!(
            self.state,
            SessionState::Ready,
            "crypto key command issued on a session that is not ready"
        );
    }

    fn handshake(&mut self) -> Result<()> {
        self.state = SessionState::Handshaking;
        match self.exchange_pin().and_then(|()| self.set_device_time(Utc::now())) {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!("Crypto key session ready");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    fn exchange_pin(&mut self) -> Result<()> {
        self.framer.write_prefixed(self.pin.as_bytes())?;
        let status = self.framer.read_u32()?;
        if status != STATUS_OK {
            warn!("Device rejected pin (status {status})");
            return Err(CryptoKeyError::Auth(status));
        }
        Ok(())
    }

    /// Push the host clock so the device can timestamp auth responses.
    fn set_device_time(&mut self, now: DateTime<Utc>) -> Result<()> {
        let millis = u64::try_from(now.timestamp_millis())
            .map_err(|_| CryptoKeyError::protocol("host clock is before the Unix epoch"))?;
        self.framer.write_u64(millis)?;
        debug!("Synchronized device clock to {millis} ms");
        Ok(())
    }

    fn end_session(&mut self) -> Result<()> {
        let result = self.framer.command(CMD_END_SESSION);
        self.state = SessionState::Disconnected;
        result
    }

    fn teardown(&mut self) -> Result<()> {
        let ended = if self.state == SessionState::Ready {
            info!("Ending crypto key session");
            self.end_session()
        } else {
            Ok(())
        };
        self.state = SessionState::Disconnected;
        let closed = self.framer.close();
        let released = self.claim.take().map_or(Ok(()), ClaimGuard::release);
        ended?;
        closed?;
        released?;
        Ok(())
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Failed to close crypto key session: {e}");
        }
    }
}
