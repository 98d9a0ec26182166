//! Wire protocol constants and command framing.
//!
//! A request is one ASCII command byte, optionally followed by u32 LE length
//! prefixes and payloads. Payloads go out in chunks of at most `chunk_size`
//! bytes. Every read is looped until the requested count arrives.

use std::io::{self, Read};

use tracing::debug;

use super::transport::Transport;
use crate::error::{CryptoKeyError, Result};

// Command codes
pub(crate) const CMD_HASH: u8 = b'h';
pub(crate) const CMD_SIGN: u8 = b's';
pub(crate) const CMD_VERIFY: u8 = b'v';
pub(crate) const CMD_PUBKEY: u8 = b'k';
pub(crate) const CMD_ENCRYPT: u8 = b'e';
pub(crate) const CMD_DECRYPT: u8 = b'd';
pub(crate) const CMD_INFO: u8 = b'i';
pub(crate) const CMD_REGISTER: u8 = b'r';
pub(crate) const CMD_AUTH: u8 = b'a';
pub(crate) const CMD_SET_PIN: u8 = b'p';
pub(crate) const CMD_TIME: u8 = b't';
pub(crate) const CMD_END_SESSION: u8 = b'x';

// Status codes
pub(crate) const STATUS_OK: u32 = 0;
/// `MBEDTLS_ERR_ECP_VERIFY_FAILED` (-0x4E00) as sent on the wire.
pub const VERIFY_FAILED: u32 = (-19968i32) as u32;

pub(crate) const DIGEST_LEN: usize = 32;

/// Chunk size used when nothing else is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 2048;
/// Largest chunk any firmware revision accepts.
pub const MAX_CHUNK_SIZE: usize = 16384;

/// Command framer over a transport.
pub(crate) struct Framer<T: Transport> {
    transport: T,
    chunk_size: usize,
    max_response_len: usize,
}

impl<T: Transport> Framer<T> {
    pub(crate) fn new(transport: T, chunk_size: usize, max_response_len: usize) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
            max_response_len,
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn command(&mut self, code: u8) -> Result<()> {
        debug!("TX command '{}'", code as char);
        self.write_all(&[code])
    }

    /// Write all of `data`, looping over partial writes.
    pub(crate) fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            match self.transport.write(&data[sent..]) {
                Ok(0) => {
                    return Err(CryptoKeyError::protocol(format!(
                        "short write: device accepted {sent} of {} bytes",
                        data.len()
                    )));
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub(crate) fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    pub(crate) fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Write a length header for a payload of `len` bytes.
    pub(crate) fn write_len(&mut self, len: u64) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| CryptoKeyError::protocol(format!("payload of {len} bytes exceeds u32 length field")))?;
        self.write_u32(len)
    }

    /// Stream `data` in chunks of at most `chunk_size` bytes.
    pub(crate) fn write_chunked(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.chunk_size) {
            self.write_all(chunk)?;
        }
        Ok(())
    }

    /// Length prefix followed by the chunked payload.
    pub(crate) fn write_prefixed(&mut self, data: &[u8]) -> Result<()> {
        self.write_len(data.len() as u64)?;
        self.write_chunked(data)
    }

    /// Copy exactly `len` bytes from `reader` to the device, one chunk at a time.
    ///
    /// The length has already been declared, so a reader that runs dry leaves
    /// the device waiting and is reported as a protocol error.
    pub(crate) fn stream_from<R: Read>(&mut self, mut reader: R, len: u64) -> Result<()> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(self.chunk_size as u64) as usize;
            let n = match reader.read(&mut buffer[..want]) {
                Ok(0) => {
                    return Err(CryptoKeyError::protocol(format!(
                        "input ended {remaining} bytes before the declared length of {len}"
                    )));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write_all(&buffer[..n])?;
            remaining -= n as u64;
        }
        debug!("TX {len} payload bytes");
        Ok(())
    }

    /// Send `data` chunk by chunk, reading back an equal-length reply after each.
    ///
    /// The device answers every chunk before accepting the next one.
    pub(crate) fn transform_chunked(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(data.len());
        for chunk in data.chunks(self.chunk_size) {
            self.write_all(chunk)?;
            let start = output.len();
            output.resize(start + chunk.len(), 0);
            self.read_into(&mut output[start..])?;
        }
        debug!("Transformed {} bytes", data.len());
        Ok(output)
    }

    /// Fill `buf` completely, looping over partial reads.
    pub(crate) fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut received = 0;
        while received < buf.len() {
            match self.transport.read(&mut buf[received..]) {
                Ok(0) => {
                    return Err(CryptoKeyError::protocol(format!(
                        "short read: got {received} of {} bytes",
                        buf.len()
                    )));
                }
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub(crate) fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a u32 length, then exactly that many bytes.
    pub(crate) fn read_prefixed(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > self.max_response_len {
            return Err(CryptoKeyError::protocol(format!(
                "response length {len} exceeds limit of {} bytes",
                self.max_response_len
            )));
        }
        let data = self.read_exact(len)?;
        debug!("RX {len} prefixed bytes");
        Ok(data)
    }

    pub(crate) fn close(&mut self) -> io::Result<()> {
        self.transport.close()
    }
}
