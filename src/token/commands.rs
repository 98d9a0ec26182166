//! Typed request/response operations on a ready session.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::protocol::{
    CMD_AUTH, CMD_DECRYPT, CMD_ENCRYPT, CMD_HASH, CMD_INFO, CMD_PUBKEY, CMD_REGISTER, CMD_SET_PIN, CMD_SIGN,
    CMD_TIME, CMD_VERIFY, Framer, STATUS_OK,
};
use super::session::Session;
use super::transport::Transport;
use super::types::{DeviceInfo, Digest, Pin, PublicKey, Signature, VerifyStatus};
use crate::error::{CryptoKeyError, Result};

impl<T: Transport> Session<T> {
    /// Hash `len` bytes read from `reader` on the device.
    pub fn hash_reader<R: Read>(&mut self, reader: R, len: u64) -> Result<Digest> {
        debug!("Hashing {len} bytes");
        self.run(|framer| {
            framer.command(CMD_HASH)?;
            framer.write_len(len)?;
            framer.stream_from(reader, len)?;
            Ok(Digest(framer.read_array()?))
        })
    }

    pub fn hash_bytes(&mut self, data: &[u8]) -> Result<Digest> {
        self.hash_reader(data, data.len() as u64)
    }

    /// Hash a file without loading it into memory.
    pub fn hash_file(&mut self, path: &Path) -> Result<Digest> {
        let (file, len) = open_sized(path)?;
        self.hash_reader(file, len)
    }

    /// Hash `len` bytes from `reader` and sign the digest with the device key.
    pub fn sign_reader<R: Read>(&mut self, reader: R, len: u64) -> Result<(Digest, Signature)> {
        debug!("Signing {len} bytes");
        self.run(|framer| {
            framer.command(CMD_SIGN)?;
            framer.write_len(len)?;
            framer.stream_from(reader, len)?;
            let digest = Digest(framer.read_array()?);
            let signature = Signature(framer.read_prefixed()?);
            Ok((digest, signature))
        })
    }

    pub fn sign_bytes(&mut self, data: &[u8]) -> Result<(Digest, Signature)> {
        self.sign_reader(data, data.len() as u64)
    }

    pub fn sign_file(&mut self, path: &Path) -> Result<(Digest, Signature)> {
        let (file, len) = open_sized(path)?;
        self.sign_reader(file, len)
    }

    /// Check a signature over a digest on the device.
    ///
    /// A mismatch is `Ok(VerifyStatus::NotVerified)`, not an error.
    pub fn verify(&mut self, digest: &Digest, signature: &Signature, public_key: &PublicKey) -> Result<VerifyStatus> {
        let code = self.run(|framer| {
            framer.command(CMD_VERIFY)?;
            framer.write_all(digest.as_bytes())?;
            framer.write_prefixed(signature.as_bytes())?;
            framer.write_prefixed(public_key.as_bytes())?;
            framer.read_u32()
        })?;
        let status = VerifyStatus::from_code(code);
        debug!("Verify result: {status}");
        Ok(status)
    }

    /// Device signing key.
    pub fn pubkey(&mut self) -> Result<PublicKey> {
        self.run(|framer| {
            framer.command(CMD_PUBKEY)?;
            read_public_key(framer)
        })
    }

    /// Encrypt with the device key. Output has the same length as the input.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.transform(CMD_ENCRYPT, data)
    }

    /// Decrypt with the device key.
    ///
    /// Ciphertext from another device decrypts to unrelated bytes rather than
    /// failing; check integrity separately.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.transform(CMD_DECRYPT, data)
    }

    /// Firmware version and device clock.
    pub fn info(&mut self) -> Result<DeviceInfo> {
        self.run(|framer| {
            framer.command(CMD_INFO)?;
            let version = String::from_utf8(framer.read_prefixed()?)
                .map_err(|e| CryptoKeyError::protocol(format!("version is not UTF-8: {e}")))?;
            let device_time = read_timestamp(framer)?;
            Ok(DeviceInfo { version, device_time })
        })
    }

    /// Current device clock.
    pub fn device_time(&mut self) -> Result<DateTime<Utc>> {
        self.run(|framer| {
            framer.command(CMD_TIME)?;
            read_timestamp(framer)
        })
    }

    /// Public key derived for a relying party and user.
    ///
    /// The same pair always yields the same key.
    pub fn register(&mut self, relying_party: &str, user: &str) -> Result<PublicKey> {
        let key = self.run(|framer| {
            framer.command(CMD_REGISTER)?;
            framer.write_prefixed(relying_party.as_bytes())?;
            framer.write_prefixed(user.as_bytes())?;
            read_public_key(framer)
        })?;
        info!("Registered {user}@{relying_party}");
        Ok(key)
    }

    /// Sign `challenge` and the device's current time window with the key
    /// [`register`](Self::register) returns for the same pair.
    pub fn auth(&mut self, relying_party: &str, user: &str, challenge: &[u8]) -> Result<Signature> {
        self.run(|framer| {
            framer.command(CMD_AUTH)?;
            framer.write_prefixed(relying_party.as_bytes())?;
            framer.write_prefixed(user.as_bytes())?;
            framer.write_prefixed(challenge)?;
            Ok(Signature(framer.read_prefixed()?))
        })
    }

    /// Change the device pin.
    ///
    /// The new pin is validated before anything is sent. The session
    /// re-handshakes with the old pin, stores the new one and re-handshakes
    /// with it.
    pub fn set_pin(&mut self, new_pin: Pin) -> Result<()> {
        new_pin.validate()?;
        self.reconnect()?;

        let status = self.run(|framer| {
            framer.command(CMD_SET_PIN)?;
            framer.write_prefixed(new_pin.as_bytes())?;
            framer.read_u32()
        })?;
        if status != STATUS_OK {
            return Err(CryptoKeyError::DeviceInternal(status));
        }

        info!("Device pin changed");
        self.replace_pin(new_pin);
        self.reconnect()
    }

    fn transform(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.run(|framer| {
            framer.command(command)?;
            framer.write_len(data.len() as u64)?;
            framer.transform_chunked(data)
        })
    }
}

fn open_sized(path: &Path) -> Result<(File, u64)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

fn read_public_key<T: Transport>(framer: &mut Framer<T>) -> Result<PublicKey> {
    let [prefix] = framer.read_array::<1>()?;
    let len = PublicKey::encoded_len(prefix)
        .ok_or_else(|| CryptoKeyError::protocol(format!("unexpected public key prefix {prefix:#04x}")))?;
    let mut bytes = Vec::with_capacity(len);
    bytes.push(prefix);
    bytes.extend_from_slice(&framer.read_exact(len - 1)?);
    PublicKey::from_bytes(&bytes)
}

fn read_timestamp<T: Transport>(framer: &mut Framer<T>) -> Result<DateTime<Utc>> {
    let millis = framer.read_u64()?;
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| CryptoKeyError::protocol(format!("device timestamp {millis} out of range")))
}
