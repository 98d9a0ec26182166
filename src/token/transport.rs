//! Byte channel to the physical device and the platform claim on it.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CryptoKeyError, Result};

/// Duplex byte channel.
///
/// `write` and `read` may move fewer bytes than asked; the framer loops.
/// `close` must be idempotent.
pub trait Transport {
    /// Write some of `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means the device has gone quiet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Fail with `NotFound` unless the device node exists.
pub fn locate(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(CryptoKeyError::not_found(format!("no device at {}", path.display())))
    }
}

/// USB CDC-ACM serial port.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    path: PathBuf,
}

impl SerialTransport {
    /// Open the serial device.
    ///
    /// # Errors
    /// `NotFound` if the node is missing or the OS reports no device.
    pub fn open(path: &Path, baud_rate: u32, timeout: Duration) -> Result<Self> {
        locate(path)?;

        let name = path.to_string_lossy();
        let port = serialport::new(name.as_ref(), baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| {
                if e.kind() == serialport::ErrorKind::NoDevice {
                    CryptoKeyError::not_found(format!("{}: {}", path.display(), e.description))
                } else {
                    CryptoKeyError::Io(io::Error::from(e))
                }
            })?;

        info!("Opened serial device {}", path.display());
        Ok(Self {
            port: Some(port),
            path: path.to_path_buf(),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let port = self.port()?;
        let n = port.write(buf)?;
        port.flush()?;
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("Closed serial device {}", self.path.display());
        }
        Ok(())
    }
}

/// Platform hook for taking the device away from a default kernel driver.
pub trait DeviceClaim {
    /// Claim the device. Returns `true` if a driver was displaced and must be
    /// restored by `release`.
    fn claim(&mut self, path: &Path) -> io::Result<bool>;

    fn release(&mut self, path: &Path) -> io::Result<()>;
}

/// Claim for platforms where the serial node is usable as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClaim;

impl DeviceClaim for NoClaim {
    fn claim(&mut self, _path: &Path) -> io::Result<bool> {
        Ok(false)
    }

    fn release(&mut self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Holds a device claim and gives it back exactly once, on `release` or drop.
pub struct ClaimGuard {
    claim: Box<dyn DeviceClaim + Send>,
    path: PathBuf,
    must_release: bool,
}

impl ClaimGuard {
    pub fn acquire(mut claim: Box<dyn DeviceClaim + Send>, path: &Path) -> Result<Self> {
        let must_release = claim.claim(path)?;
        if must_release {
            info!("Claimed {} from platform driver", path.display());
        }
        Ok(Self {
            claim,
            path: path.to_path_buf(),
            must_release,
        })
    }

    pub fn release(mut self) -> io::Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> io::Result<()> {
        if !self.must_release {
            return Ok(());
        }
        self.must_release = false;
        info!("Releasing {} back to platform driver", self.path.display());
        self.claim.release(&self.path)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release device claim: {e}");
        }
    }
}
