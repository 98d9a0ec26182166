//! Simulated crypto key for tests.
//!
//! Parses the host byte stream incrementally and answers the way the firmware
//! does. SHA-256 and secp256k1 ECDSA are real; a SHA-256 keystream stands in
//! for AES.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha2::{Digest as _, Sha256};

use super::auth::{DEFAULT_WINDOW_MS, window_start};
use super::protocol::{
    CMD_AUTH, CMD_DECRYPT, CMD_ENCRYPT, CMD_END_SESSION, CMD_HASH, CMD_INFO, CMD_PUBKEY, CMD_REGISTER,
    CMD_SET_PIN, CMD_SIGN, CMD_TIME, CMD_VERIFY, DIGEST_LEN, VERIFY_FAILED,
};
use super::transport::Transport;

pub(crate) const MOCK_VERSION: &str = "pico-crypto-key 0.5.0";

const STATUS_INVALID_PIN: u32 = 1;
const STATUS_INVALID_CMD: u32 = 2;
/// `MBEDTLS_ERR_ECP_BAD_INPUT_DATA`
pub(crate) const STATUS_BAD_INPUT: u32 = (-0x4F80i32) as u32;

/// Shared, ordered record of device and host events.
pub(crate) type EventLog = Arc<Mutex<Vec<&'static str>>>;

enum Mode {
    AwaitPin,
    AwaitTime,
    Repl,
    Hashing { remaining: u64, hasher: Sha256, sign: bool },
    Crypting { remaining: u64, position: u64 },
}

struct Device {
    seed: [u8; 32],
    pin: Vec<u8>,
    mode: Mode,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    synced: Option<(u64, Instant)>,
    clock_offset_ms: i64,
    uncompressed_keys: bool,
    mute: bool,
    max_io: usize,
    device_chunk: Option<usize>,
    events: Option<EventLog>,
    closed: bool,
    wire: Vec<u8>,
    handshakes: usize,
}

/// Cloneable handle to one simulated device.
#[derive(Clone)]
pub(crate) struct MockToken {
    device: Rc<RefCell<Device>>,
}

impl MockToken {
    pub(crate) fn new(pin: &str) -> Self {
        Self::with_seed(pin, b"mock-device-a")
    }

    /// A device whose keys are derived from `seed`.
    pub(crate) fn with_seed(pin: &str, seed: &[u8]) -> Self {
        let device = Device {
            seed: Sha256::digest(seed).into(),
            pin: pin.as_bytes().to_vec(),
            mode: Mode::AwaitPin,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            synced: None,
            clock_offset_ms: 0,
            uncompressed_keys: false,
            mute: false,
            max_io: usize::MAX,
            device_chunk: None,
            events: None,
            closed: false,
            wire: Vec::new(),
            handshakes: 0,
        };
        Self {
            device: Rc::new(RefCell::new(device)),
        }
    }

    /// Cap the bytes moved per read/write call.
    pub(crate) fn with_max_io(self, max_io: usize) -> Self {
        self.device.borrow_mut().max_io = max_io;
        self
    }

    /// Buffer a full chunk of this size before answering encrypt/decrypt,
    /// as the firmware does.
    pub(crate) fn with_device_chunk(self, chunk: usize) -> Self {
        self.device.borrow_mut().device_chunk = Some(chunk);
        self
    }

    /// Record `end-session` and `close` into `events`.
    pub(crate) fn with_event_log(self, events: EventLog) -> Self {
        self.device.borrow_mut().events = Some(events);
        self
    }

    /// Return 65-byte keys, as later firmware does.
    pub(crate) fn with_uncompressed_keys(self) -> Self {
        self.device.borrow_mut().uncompressed_keys = true;
        self
    }

    /// Stop answering commands after the handshake.
    pub(crate) fn set_mute(&self, mute: bool) {
        self.device.borrow_mut().mute = mute;
    }

    pub(crate) fn set_clock_offset_ms(&self, offset: i64) {
        self.device.borrow_mut().clock_offset_ms = offset;
    }

    pub(crate) fn pin(&self) -> Vec<u8> {
        self.device.borrow().pin.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.device.borrow().closed
    }

    pub(crate) fn is_awaiting_pin(&self) -> bool {
        matches!(self.device.borrow().mode, Mode::AwaitPin)
    }

    pub(crate) fn synced_time_ms(&self) -> Option<u64> {
        self.device.borrow().synced.map(|(ms, _)| ms)
    }

    pub(crate) fn handshakes(&self) -> usize {
        self.device.borrow().handshakes
    }

    /// Every byte the host has written so far.
    pub(crate) fn wire(&self) -> Vec<u8> {
        self.device.borrow().wire.clone()
    }

    /// Key pair `register` derives for a relying party and user.
    pub(crate) fn derived_key(&self, relying_party: &str, user: &str) -> SigningKey {
        self.device.borrow().derived_key(relying_party.as_bytes(), user.as_bytes())
    }
}

impl Transport for MockToken {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut device = self.device.borrow_mut();
        if device.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock device closed"));
        }
        let n = buf.len().min(device.max_io);
        device.inbox.extend_from_slice(&buf[..n]);
        device.wire.extend_from_slice(&buf[..n]);
        device.pump();
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut device = self.device.borrow_mut();
        if device.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock device closed"));
        }
        let n = buf.len().min(device.max_io).min(device.outbox.len());
        for slot in buf.iter_mut().take(n) {
            *slot = device.outbox.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        let mut device = self.device.borrow_mut();
        if !device.closed {
            device.record("close");
        }
        device.closed = true;
        Ok(())
    }
}

/// Parses fields from the front of the inbox without consuming on failure.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Some(u64::from_le_bytes(raw))
    }

    fn prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }
}

impl Device {
    fn pump(&mut self) {
        while self.step() {}
    }

    /// Advance the state machine once. Returns false when more input is needed.
    fn step(&mut self) -> bool {
        match std::mem::replace(&mut self.mode, Mode::Repl) {
            Mode::AwaitPin => {
                let mut cursor = Cursor { buf: &self.inbox, pos: 0 };
                let Some(pin) = cursor.prefixed() else {
                    self.mode = Mode::AwaitPin;
                    return false;
                };
                let accepted = pin == self.pin.as_slice();
                let used = cursor.pos;
                self.inbox.drain(..used);
                if accepted {
                    self.push_u32(0);
                    self.mode = Mode::AwaitTime;
                } else {
                    self.push_u32(STATUS_INVALID_PIN);
                    self.mode = Mode::AwaitPin;
                }
                true
            }
            Mode::AwaitTime => {
                let mut cursor = Cursor { buf: &self.inbox, pos: 0 };
                let Some(millis) = cursor.u64() else {
                    self.mode = Mode::AwaitTime;
                    return false;
                };
                self.inbox.drain(..8);
                self.synced = Some((millis, Instant::now()));
                self.handshakes += 1;
                true
            }
            Mode::Repl => self.dispatch(),
            Mode::Hashing {
                mut remaining,
                mut hasher,
                sign,
            } => {
                let take = (self.inbox.len() as u64).min(remaining) as usize;
                hasher.update(&self.inbox[..take]);
                self.inbox.drain(..take);
                remaining -= take as u64;
                if remaining > 0 {
                    self.mode = Mode::Hashing { remaining, hasher, sign };
                    return take > 0;
                }
                let digest: [u8; DIGEST_LEN] = hasher.finalize().into();
                self.push(&digest);
                if sign {
                    let signature = sign_prehash(&self.device_key(), &digest);
                    self.push_prefixed(&signature);
                }
                true
            }
            Mode::Crypting {
                mut remaining,
                mut position,
            } => {
                let available = self.inbox.len() as u64;
                let take = match self.device_chunk {
                    Some(chunk) => {
                        let block = (chunk as u64).min(remaining);
                        if available < block { 0 } else { block as usize }
                    }
                    None => available.min(remaining) as usize,
                };
                let input: Vec<u8> = self.inbox.drain(..take).collect();
                for byte in input {
                    let out = byte ^ self.keystream(position);
                    self.outbox.push_back(out);
                    position += 1;
                }
                remaining -= take as u64;
                if remaining > 0 {
                    self.mode = Mode::Crypting { remaining, position };
                    return take > 0;
                }
                true
            }
        }
    }

    /// Parse and answer one command in REPL mode.
    fn dispatch(&mut self) -> bool {
        if self.mute {
            return false;
        }
        let inbox = std::mem::take(&mut self.inbox);
        let mut cursor = Cursor { buf: &inbox, pos: 0 };
        let handled = cursor.bytes(1).and_then(|cmd| self.handle(cmd[0], &mut cursor));
        let used = cursor.pos;
        self.inbox = inbox;
        match handled {
            Some(()) => {
                self.inbox.drain(..used);
                true
            }
            None => false,
        }
    }

    /// Returns `None` if the request is not complete yet.
    fn handle(&mut self, cmd: u8, cursor: &mut Cursor<'_>) -> Option<()> {
        match cmd {
            CMD_END_SESSION => {
                self.record("end-session");
                self.mode = Mode::AwaitPin;
            }
            CMD_HASH | CMD_SIGN => {
                let remaining = u64::from(cursor.u32()?);
                self.mode = Mode::Hashing {
                    remaining,
                    hasher: Sha256::new(),
                    sign: cmd == CMD_SIGN,
                };
            }
            CMD_ENCRYPT | CMD_DECRYPT => {
                let remaining = u64::from(cursor.u32()?);
                self.mode = Mode::Crypting { remaining, position: 0 };
            }
            CMD_VERIFY => {
                let digest = cursor.bytes(DIGEST_LEN)?;
                let signature = cursor.prefixed()?;
                let public_key = cursor.prefixed()?;
                let status = verify_status(digest, signature, public_key);
                self.push_u32(status);
            }
            CMD_PUBKEY => {
                let key = self.encode_key(&self.device_key());
                self.push(&key);
            }
            CMD_INFO => {
                self.push_prefixed(MOCK_VERSION.as_bytes());
                let now = self.now_ms();
                self.push(&now.to_le_bytes());
            }
            CMD_TIME => {
                let now = self.now_ms();
                self.push(&now.to_le_bytes());
            }
            CMD_REGISTER => {
                let relying_party = cursor.prefixed()?;
                let user = cursor.prefixed()?;
                let key = self.encode_key(&self.derived_key(relying_party, user));
                self.push(&key);
            }
            CMD_AUTH => {
                let relying_party = cursor.prefixed()?;
                let user = cursor.prefixed()?;
                let challenge = cursor.prefixed()?;
                let window = window_start(self.now_ms(), DEFAULT_WINDOW_MS);
                let mut message = challenge.to_vec();
                message.extend_from_slice(&window.to_le_bytes());
                let digest = Sha256::digest(&message);
                let signature = sign_prehash(&self.derived_key(relying_party, user), &digest);
                self.push_prefixed(&signature);
            }
            CMD_SET_PIN => {
                let pin = cursor.prefixed()?;
                self.pin = pin.to_vec();
                self.push_u32(0);
            }
            _ => self.push_u32(STATUS_INVALID_CMD),
        }
        Some(())
    }

    fn record(&self, event: &'static str) {
        if let Some(events) = &self.events {
            events.lock().unwrap().push(event);
        }
    }

    fn device_key(&self) -> SigningKey {
        key_from(&Sha256::digest(self.seed))
    }

    fn derived_key(&self, relying_party: &[u8], user: &[u8]) -> SigningKey {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update((relying_party.len() as u32).to_le_bytes());
        hasher.update(relying_party);
        hasher.update((user.len() as u32).to_le_bytes());
        hasher.update(user);
        key_from(&hasher.finalize())
    }

    fn encode_key(&self, key: &SigningKey) -> Vec<u8> {
        let compress = !self.uncompressed_keys;
        key.verifying_key().to_encoded_point(compress).as_bytes().to_vec()
    }

    fn keystream(&self, position: u64) -> u8 {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(b"stream");
        hasher.update((position / 32).to_le_bytes());
        hasher.finalize()[(position % 32) as usize]
    }

    fn now_ms(&self) -> u64 {
        let (synced, at) = self.synced.unwrap_or((0, Instant::now()));
        let now = synced as i64 + at.elapsed().as_millis() as i64 + self.clock_offset_ms;
        now.max(0) as u64
    }

    fn push(&mut self, bytes: &[u8]) {
        self.outbox.extend(bytes.iter().copied());
    }

    fn push_u32(&mut self, value: u32) {
        self.push(&value.to_le_bytes());
    }

    fn push_prefixed(&mut self, bytes: &[u8]) {
        self.push_u32(bytes.len() as u32);
        self.push(bytes);
    }
}

fn key_from(secret: &[u8]) -> SigningKey {
    SigningKey::from_slice(secret).expect("sha256 output is a valid secp256k1 scalar")
}

fn sign_prehash(key: &SigningKey, digest: &[u8]) -> Vec<u8> {
    let signature: EcdsaSignature = key.sign_prehash(digest).expect("prehash signing succeeds");
    signature.to_der().as_bytes().to_vec()
}

fn verify_status(digest: &[u8], signature: &[u8], public_key: &[u8]) -> u32 {
    let Ok(key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return STATUS_BAD_INPUT;
    };
    let Ok(signature) = EcdsaSignature::from_der(signature) else {
        return STATUS_BAD_INPUT;
    };
    match key.verify_prehash(digest, &signature) {
        Ok(()) => 0,
        Err(_) => VERIFY_FAILED,
    }
}
