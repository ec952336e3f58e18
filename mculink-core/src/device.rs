//! Device-side frame state machine
//!
//! The embedded counterpart of the host bridge. It reads the same frame
//! format one byte at a time:
//!
//! ```text
//! ReadKeys -> ReadLength -> ReadPayload -> ReadChecksum -> Dispatch -> Acknowledge -> ReadKeys
//! ```
//!
//! Two driving modes:
//! - [`DeviceFsm::step`] never waits; call it from a tick or interrupt handler.
//!   It keeps the partial-read position between calls and returns `true` once
//!   a verified frame is waiting for [`DeviceFsm::process`].
//! - [`DeviceFsm::poll_blocking`] spins on the link, giving each stage up to
//!   a timeout, then processes the frame.
//!
//! The payload buffer is grown to the declared length before a single payload
//! byte is read. A length above [`DeviceConfig::max_payload`], or a failed
//! reservation, halts the machine for good.

use crate::checksum::ChecksumTable;
use crate::constants::{
    LengthSelector, KEY_HEADER_SIZE, MAJOR_KEY_ACK, MAJOR_KEY_DEVICE_READY, MAJOR_KEY_ERROR,
    MAJOR_KEY_RESET,
};
use crate::decoder::KeyHeader;
use crate::encoder::{encode_ack, encode_device_ready, encode_error_ack, encode_frame};
use crate::error::FrameError;
use crate::types::Frame;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::time::Instant;

#[cfg(feature = "logging")]
use tracing::{debug, error, warn};

/// Default payload ceiling on the device (64 KiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Default per-stage timeout for the blocking loop
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 500;

/// Errors raised by the device state machine
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The payload buffer could not grow to the declared length. Fatal.
    #[error("Buffer exhausted: frame declares {requested} payload bytes, limit {limit}")]
    BufferExhausted {
        /// Declared payload length
        requested: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// The machine halted after a fatal error and accepts no more input
    #[error("Device state machine halted")]
    Halted,

    /// The byte link failed
    #[error("Link error: {0}")]
    Link(String),

    /// Encoding a reply failed
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Byte I/O seam between the state machine and the hardware
pub trait DeviceLink {
    /// Next received byte, if one is available right now
    fn read_byte(&mut self) -> Option<u8>;

    /// Transmit bytes (may block until the peripheral accepts them)
    fn write(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Monotonic milliseconds, used by the blocking loop
    fn now_ms(&self) -> u64;

    /// Called while the blocking loop waits for input
    fn idle(&mut self) {}
}

/// Outgoing frames produced by a handler
#[derive(Debug, Default)]
pub struct Replies {
    frames: Vec<(u8, u8, Vec<u8>)>,
}

impl Replies {
    /// Queue a reply frame; it is written after the acknowledgement
    pub fn send(&mut self, major_key: u8, minor_key: u8, payload: impl Into<Vec<u8>>) {
        self.frames.push((major_key, minor_key, payload.into()));
    }

    /// Number of queued replies
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no reply was queued
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Per-subsystem frame handler
pub trait SubsystemHandler {
    /// Handle one verified frame for this handler's major key
    fn handle(&mut self, minor_key: u8, payload: &[u8], replies: &mut Replies)
        -> Result<(), DeviceError>;
}

impl<F> SubsystemHandler for F
where
    F: FnMut(u8, &[u8], &mut Replies) -> Result<(), DeviceError>,
{
    fn handle(
        &mut self,
        minor_key: u8,
        payload: &[u8],
        replies: &mut Replies,
    ) -> Result<(), DeviceError> {
        self(minor_key, payload, replies)
    }
}

/// Device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Largest payload the device will buffer
    pub max_payload: usize,
    /// Per-stage timeout for [`DeviceFsm::poll_blocking`]
    pub stage_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        }
    }
}

/// Position of the state machine inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for byte 0 and the minor key
    ReadKeys,
    /// Reading the length field
    ReadLength,
    /// Reading payload bytes
    ReadPayload,
    /// Reading the checksum trailer
    ReadChecksum,
    /// A verified frame waits for [`DeviceFsm::process`]
    Dispatch,
    /// Acknowledgement and replies are being written
    Acknowledge,
    /// Fatal error; no further input is accepted
    Halted,
}

/// Counters kept by the state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Frames dispatched to handlers
    pub frames_dispatched: u64,
    /// Frames dropped on checksum mismatch
    pub checksum_errors: u64,
    /// Frames with no registered handler
    pub unknown_keys: u64,
    /// Partial frames dropped by the blocking loop's stage timeout
    pub stage_timeouts: u64,
    /// Resets received
    pub resets: u64,
}

/// The device-side frame state machine
pub struct DeviceFsm<L: DeviceLink> {
    link: L,
    config: DeviceConfig,
    checksums: ChecksumTable,
    handlers: BTreeMap<u8, Box<dyn SubsystemHandler>>,
    reset_hook: Option<Box<dyn FnMut()>>,
    stage: Stage,
    keys: Option<KeyHeader>,
    /// Bytes covered by the checksum: keys, length field, payload
    frame: Vec<u8>,
    payload_len: usize,
    checksum: Vec<u8>,
    stats: DeviceStats,
}

impl<L: DeviceLink> DeviceFsm<L> {
    /// Create a state machine with default checksums and configuration
    pub fn new(link: L) -> Self {
        Self::with_config(link, ChecksumTable::new(), DeviceConfig::default())
    }

    /// Create a state machine with explicit checksums and configuration
    pub fn with_config(link: L, checksums: ChecksumTable, config: DeviceConfig) -> Self {
        Self {
            link,
            config,
            checksums,
            handlers: BTreeMap::new(),
            reset_hook: None,
            stage: Stage::ReadKeys,
            keys: None,
            frame: Vec::with_capacity(KEY_HEADER_SIZE + 4),
            payload_len: 0,
            checksum: Vec::with_capacity(4),
            stats: DeviceStats::default(),
        }
    }

    /// Register the handler for `major_key`
    pub fn register(&mut self, major_key: u8, handler: impl SubsystemHandler + 'static) {
        self.handlers.insert(major_key, Box::new(handler));
    }

    /// Hook run when the host requests a reset
    pub fn on_reset(&mut self, hook: impl FnMut() + 'static) {
        self.reset_hook = Some(Box::new(hook));
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Counters
    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// Capacity of the frame buffer
    pub fn buffer_capacity(&self) -> usize {
        self.frame.capacity()
    }

    /// Borrow the link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Mutably borrow the link
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// The verified frame waiting for dispatch
    pub fn pending_frame(&self) -> Option<Frame> {
        if self.stage != Stage::Dispatch {
            return None;
        }
        let keys = self.keys?;
        let start = KEY_HEADER_SIZE + keys.selector.width();
        Some(Frame::with_checksum(
            keys.major_key,
            keys.minor_key,
            Bytes::copy_from_slice(&self.frame[start..]),
            Bytes::copy_from_slice(&self.checksum),
        ))
    }

    /// Tell the host the device can take the next paced chunk
    pub fn signal_ready(&mut self) -> Result<(), DeviceError> {
        self.ensure_running()?;
        let bytes = encode_device_ready(&self.checksums)?;
        self.link.write(&bytes)
    }

    /// Consume available bytes without waiting.
    ///
    /// Returns `Ok(true)` when a verified frame is ready for [`process`](Self::process).
    pub fn step(&mut self) -> Result<bool, DeviceError> {
        self.ensure_running()?;
        loop {
            match self.stage {
                Stage::Dispatch => return Ok(true),
                Stage::Acknowledge | Stage::Halted => return Ok(false),
                Stage::ReadKeys => {
                    if !self.fill(KEY_HEADER_SIZE) {
                        return Ok(false);
                    }
                    let keys = KeyHeader::parse(self.frame[0], self.frame[1]);
                    self.keys = Some(keys);
                    self.stage = if keys.selector == LengthSelector::None {
                        self.payload_len = 0;
                        self.begin_checksum()
                    } else {
                        Stage::ReadLength
                    };
                }
                Stage::ReadLength => {
                    let width = self.selector().width();
                    if !self.fill(KEY_HEADER_SIZE + width) {
                        return Ok(false);
                    }
                    let len = self.frame[KEY_HEADER_SIZE..]
                        .iter()
                        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
                    self.grow_for(len)?;
                    self.payload_len = len;
                    self.stage = if len == 0 {
                        self.begin_checksum()
                    } else {
                        Stage::ReadPayload
                    };
                }
                Stage::ReadPayload => {
                    let target = self.header_len() + self.payload_len;
                    if !self.fill(target) {
                        return Ok(false);
                    }
                    self.stage = self.begin_checksum();
                }
                Stage::ReadChecksum => {
                    let size = self.checksums.slot(self.major_key()).size();
                    while self.checksum.len() < size {
                        match self.link.read_byte() {
                            Some(b) => self.checksum.push(b),
                            None => return Ok(false),
                        }
                    }
                    if self.verify()? {
                        self.stage = Stage::Dispatch;
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Dispatch the ready frame, acknowledge it, write replies.
    ///
    /// Returns the major key processed, or `None` when no frame was ready.
    pub fn process(&mut self) -> Result<Option<u8>, DeviceError> {
        self.ensure_running()?;
        if self.stage != Stage::Dispatch {
            return Ok(None);
        }
        let keys = match self.keys {
            Some(k) => k,
            None => {
                self.reset_frame();
                return Ok(None);
            }
        };
        let payload_start = self.header_len();
        let payload = self.frame[payload_start..].to_vec();

        let mut replies = Replies::default();
        let written = self
            .dispatch(keys, &payload, &mut replies)
            .and_then(|ack| {
                self.stage = Stage::Acknowledge;
                self.acknowledge(ack, replies)
            });

        // The frame is spent whether or not the link took the ack
        self.reset_frame();
        written.map(|()| Some(keys.major_key))
    }

    /// Run the handler for `keys`; returns the acknowledgement to send
    fn dispatch(
        &mut self,
        keys: KeyHeader,
        payload: &[u8],
        replies: &mut Replies,
    ) -> Result<Option<Bytes>, DeviceError> {
        let ack = match keys.major_key {
            MAJOR_KEY_ACK | MAJOR_KEY_DEVICE_READY | MAJOR_KEY_ERROR => None,
            MAJOR_KEY_RESET => {
                self.stats.resets += 1;
                if let Some(hook) = self.reset_hook.as_mut() {
                    hook();
                }
                Some(encode_ack(MAJOR_KEY_RESET, &self.checksums)?)
            }
            major => match self.handlers.get_mut(&major) {
                Some(handler) => {
                    #[cfg(feature = "logging")]
                    debug!(
                        "Dispatching major {} minor {} ({} bytes)",
                        major,
                        keys.minor_key,
                        payload.len()
                    );
                    handler.handle(keys.minor_key, payload, replies)?;
                    self.stats.frames_dispatched += 1;
                    Some(encode_ack(major, &self.checksums)?)
                }
                None => {
                    #[cfg(feature = "logging")]
                    warn!("No handler for major key {}", major);
                    self.stats.unknown_keys += 1;
                    Some(encode_error_ack(&self.checksums)?)
                }
            },
        };
        Ok(ack)
    }

    /// Write the acknowledgement, then the handler's replies
    fn acknowledge(&mut self, ack: Option<Bytes>, replies: Replies) -> Result<(), DeviceError> {
        if let Some(ack) = ack {
            self.link.write(&ack)?;
        }
        for (major, minor, body) in replies.frames {
            let bytes = encode_frame(major, minor, &body, self.checksums.slot(major))?;
            self.link.write(&bytes)?;
        }
        Ok(())
    }

    /// Step and, if a frame completed, process it
    pub fn run_once(&mut self) -> Result<Option<u8>, DeviceError> {
        if self.step()? {
            self.process()
        } else {
            Ok(None)
        }
    }

    /// Wait on the link for one frame, giving each stage up to the configured timeout.
    ///
    /// Returns the processed major key, or `None` if the link went quiet. A
    /// timeout in the middle of a frame drops the partial frame.
    pub fn poll_blocking(&mut self) -> Result<Option<u8>, DeviceError> {
        let timeout = self.config.stage_timeout_ms;
        let mut stage = self.stage;
        let mut progress = self.progress();
        let mut entered = self.link.now_ms();

        loop {
            if self.step()? {
                return self.process();
            }
            let now = self.link.now_ms();
            if self.stage != stage || self.progress() != progress {
                stage = self.stage;
                progress = self.progress();
                entered = now;
            } else if now.saturating_sub(entered) >= timeout {
                if progress > 0 {
                    #[cfg(feature = "logging")]
                    warn!("Stage {:?} timed out, dropping partial frame", stage);
                    self.stats.stage_timeouts += 1;
                    self.reset_frame();
                }
                return Ok(None);
            }
            self.link.idle();
        }
    }

    fn ensure_running(&self) -> Result<(), DeviceError> {
        if self.stage == Stage::Halted {
            Err(DeviceError::Halted)
        } else {
            Ok(())
        }
    }

    /// Bytes of the current frame read so far
    fn progress(&self) -> usize {
        self.frame.len() + self.checksum.len()
    }

    fn selector(&self) -> LengthSelector {
        self.keys.map_or(LengthSelector::None, |k| k.selector)
    }

    fn major_key(&self) -> u8 {
        self.keys.map_or(MAJOR_KEY_ERROR, |k| k.major_key)
    }

    fn header_len(&self) -> usize {
        KEY_HEADER_SIZE + self.selector().width()
    }

    /// Read into the frame buffer until it holds `target` bytes. Capacity is
    /// confirmed before the payload stage starts.
    fn fill(&mut self, target: usize) -> bool {
        debug_assert!(self.frame.capacity() >= target);
        while self.frame.len() < target {
            match self.link.read_byte() {
                Some(b) => self.frame.push(b),
                None => return false,
            }
        }
        true
    }

    fn grow_for(&mut self, payload_len: usize) -> Result<(), DeviceError> {
        let limit = self.config.max_payload;
        if payload_len > limit {
            return Err(self.halt(payload_len, limit));
        }
        let needed = self.header_len() + payload_len;
        let extra = needed.saturating_sub(self.frame.len());
        if self.frame.try_reserve_exact(extra).is_err() {
            return Err(self.halt(payload_len, limit));
        }
        Ok(())
    }

    fn halt(&mut self, requested: usize, limit: usize) -> DeviceError {
        #[cfg(feature = "logging")]
        error!(
            "Cannot buffer {} payload bytes (limit {}), halting",
            requested, limit
        );
        self.stage = Stage::Halted;
        self.frame.clear();
        self.checksum.clear();
        DeviceError::BufferExhausted { requested, limit }
    }

    fn begin_checksum(&mut self) -> Stage {
        self.checksum.clear();
        Stage::ReadChecksum
    }

    /// Verify the trailer. On mismatch, send an error ack and start over.
    fn verify(&mut self) -> Result<bool, DeviceError> {
        let major = self.major_key();
        let slot = self.checksums.slot(major);
        match slot.verify(major, &self.frame, &self.checksum) {
            Ok(()) => Ok(true),
            Err(FrameError::ChecksumMismatch { .. }) => {
                #[cfg(feature = "logging")]
                warn!("Checksum mismatch on major key {}, dropping frame", major);
                self.stats.checksum_errors += 1;
                self.reset_frame();
                let nack = encode_error_ack(&self.checksums)?;
                self.link.write(&nack)?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reset_frame(&mut self) {
        self.stage = Stage::ReadKeys;
        self.keys = None;
        self.frame.clear();
        self.payload_len = 0;
        self.checksum.clear();
    }
}

/// [`DeviceLink`] over any blocking std stream (TCP socket, serial port).
///
/// Set a short read timeout on the stream; timeouts read as "no byte yet".
pub struct IoLink<T: Read + Write> {
    io: T,
    buf: Vec<u8>,
    pos: usize,
    start: Instant,
    closed: bool,
}

impl<T: Read + Write> IoLink<T> {
    /// Wrap a stream
    pub fn new(io: T) -> Self {
        Self {
            io,
            buf: Vec::with_capacity(512),
            pos: 0,
            start: Instant::now(),
            closed: false,
        }
    }

    /// Whether the peer closed the stream
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T: Read + Write> DeviceLink for IoLink<T> {
    fn read_byte(&mut self) -> Option<u8> {
        if self.pos >= self.buf.len() {
            if self.closed {
                return None;
            }
            self.buf.resize(512, 0);
            self.pos = 0;
            match self.io.read(&mut self.buf) {
                Ok(0) => {
                    self.closed = true;
                    self.buf.clear();
                    return None;
                }
                Ok(n) => self.buf.truncate(n),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.buf.clear();
                    return None;
                }
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    warn!("Link read failed: {}", _e);
                    self.closed = true;
                    self.buf.clear();
                    return None;
                }
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Some(b)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        self.io
            .write_all(bytes)
            .and_then(|_| self.io.flush())
            .map_err(|e| DeviceError::Link(e.to_string()))
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{ChecksumConfig, ChecksumKind};
    use crate::decoder::decode_all;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct MemLink {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        clock: u64,
        fail_next_write: bool,
    }

    impl MemLink {
        fn feed(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }
    }

    impl DeviceLink for MemLink {
        fn read_byte(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
            if std::mem::take(&mut self.fail_next_write) {
                return Err(DeviceError::Link("tx busy".into()));
            }
            self.tx.extend_from_slice(bytes);
            Ok(())
        }

        fn now_ms(&self) -> u64 {
            self.clock
        }

        fn idle(&mut self) {
            self.clock += 10;
        }
    }

    fn echo_fsm() -> DeviceFsm<MemLink> {
        let mut fsm = DeviceFsm::new(MemLink::default());
        fsm.register(4, |minor: u8, payload: &[u8], replies: &mut Replies| {
            replies.send(4, minor, payload.to_vec());
            Ok(())
        });
        fsm
    }

    fn sent_frames(fsm: &DeviceFsm<MemLink>) -> Vec<Frame> {
        let (frames, used) = decode_all(&fsm.link().tx, &ChecksumTable::new()).unwrap();
        assert_eq!(used, fsm.link().tx.len());
        frames
    }

    #[test]
    fn test_full_frame_is_acked_then_replied() {
        let table = ChecksumTable::new();
        let mut fsm = echo_fsm();
        fsm.link_mut()
            .feed(&encode_frame(4, 9, b"ping", table.slot(4)).unwrap());

        assert!(fsm.step().unwrap());
        assert_eq!(fsm.pending_frame().unwrap().payload.as_ref(), b"ping");
        assert_eq!(fsm.process().unwrap(), Some(4));
        assert_eq!(fsm.stage(), Stage::ReadKeys);

        let frames = sent_frames(&fsm);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].acked_key(), Some(4));
        assert_eq!(frames[1].minor_key, 9);
        assert_eq!(frames[1].payload.as_ref(), b"ping");
    }

    #[test]
    fn test_failed_ack_write_does_not_wedge_the_machine() {
        let table = ChecksumTable::new();
        let mut fsm = echo_fsm();
        fsm.link_mut().fail_next_write = true;
        fsm.link_mut()
            .feed(&encode_frame(4, 0, b"one", table.slot(4)).unwrap());

        assert!(matches!(fsm.run_once(), Err(DeviceError::Link(_))));
        assert_eq!(fsm.stage(), Stage::ReadKeys);

        fsm.link_mut()
            .feed(&encode_frame(4, 1, b"two", table.slot(4)).unwrap());
        assert_eq!(fsm.run_once().unwrap(), Some(4));
        assert!(fsm.link().rx.is_empty());

        let frames = sent_frames(&fsm);
        assert_eq!(frames[0].acked_key(), Some(4));
        assert_eq!(frames[1].payload.as_ref(), b"two");
    }

    #[test]
    fn test_step_byte_at_a_time_keeps_position() {
        let table = ChecksumTable::new();
        let bytes = encode_frame(4, 1, &[7u8; 300], table.slot(4)).unwrap();
        let mut fsm = echo_fsm();

        for (i, b) in bytes.iter().enumerate() {
            fsm.link_mut().feed(&[*b]);
            let ready = fsm.step().unwrap();
            assert_eq!(ready, i == bytes.len() - 1, "byte {}", i);
        }
        assert_eq!(fsm.pending_frame().unwrap().payload.len(), 300);
    }

    #[test]
    fn test_buffer_grows_before_payload() {
        let table = ChecksumTable::new();
        let bytes = encode_frame(4, 1, &[1u8; 5000], table.slot(4)).unwrap();
        let mut fsm = echo_fsm();

        // Keys + 2 length bytes only
        fsm.link_mut().feed(&bytes[..4]);
        assert!(!fsm.step().unwrap());
        assert_eq!(fsm.stage(), Stage::ReadPayload);
        assert!(fsm.buffer_capacity() >= 4 + 5000);

        fsm.link_mut().feed(&bytes[4..]);
        assert!(fsm.step().unwrap());
    }

    #[test]
    fn test_payload_at_limit_is_accepted() {
        let table = ChecksumTable::new();
        let config = DeviceConfig {
            max_payload: 256,
            ..DeviceConfig::default()
        };
        let mut fsm = DeviceFsm::with_config(MemLink::default(), table.clone(), config);
        fsm.register(4, |_: u8, _: &[u8], _: &mut Replies| Ok(()));
        fsm.link_mut()
            .feed(&encode_frame(4, 0, &[0u8; 256], table.slot(4)).unwrap());
        assert!(fsm.step().unwrap());
        assert_eq!(fsm.process().unwrap(), Some(4));
    }

    #[test]
    fn test_payload_over_limit_halts() {
        let table = ChecksumTable::new();
        let config = DeviceConfig {
            max_payload: 256,
            ..DeviceConfig::default()
        };
        let mut fsm = DeviceFsm::with_config(MemLink::default(), table.clone(), config);
        fsm.link_mut()
            .feed(&encode_frame(4, 0, &[0u8; 257], table.slot(4)).unwrap());

        let err = fsm.step().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::BufferExhausted {
                requested: 257,
                limit: 256
            }
        ));
        assert_eq!(fsm.stage(), Stage::Halted);

        // Halted for good, even for a perfectly valid frame
        fsm.link_mut().feed(&encode_ack(4, &table).unwrap());
        assert!(matches!(fsm.step(), Err(DeviceError::Halted)));
        assert!(fsm.link().tx.is_empty());
    }

    #[test]
    fn test_checksum_failure_resets_without_halting() {
        let table = ChecksumTable::new();
        let mut bad = encode_frame(4, 0, b"abc", table.slot(4)).unwrap().to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut fsm = echo_fsm();
        fsm.link_mut().feed(&bad);
        assert!(!fsm.step().unwrap());
        assert_eq!(fsm.stage(), Stage::ReadKeys);
        assert_eq!(fsm.stats().checksum_errors, 1);

        let frames = sent_frames(&fsm);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].acked_key(), Some(MAJOR_KEY_ERROR));

        // Next frame goes through
        fsm.link_mut()
            .feed(&encode_frame(4, 0, b"ok", table.slot(4)).unwrap());
        assert_eq!(fsm.run_once().unwrap(), Some(4));
    }

    #[test]
    fn test_unknown_key_gets_error_ack() {
        let table = ChecksumTable::new();
        let mut fsm = echo_fsm();
        fsm.link_mut()
            .feed(&encode_frame(30, 0, b"?", table.slot(30)).unwrap());
        assert_eq!(fsm.run_once().unwrap(), Some(30));
        assert_eq!(fsm.stats().unknown_keys, 1);
        assert_eq!(sent_frames(&fsm)[0].acked_key(), Some(MAJOR_KEY_ERROR));
    }

    #[test]
    fn test_reset_runs_hook_and_acks() {
        let table = ChecksumTable::new();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let mut fsm = echo_fsm();
        fsm.on_reset(move || flag.set(true));
        fsm.link_mut()
            .feed(&crate::encoder::encode_reset(&table).unwrap());

        assert_eq!(fsm.run_once().unwrap(), Some(MAJOR_KEY_RESET));
        assert!(fired.get());
        assert_eq!(sent_frames(&fsm)[0].acked_key(), Some(MAJOR_KEY_RESET));
    }

    #[test]
    fn test_host_ack_is_not_acknowledged() {
        let table = ChecksumTable::new();
        let mut fsm = echo_fsm();
        fsm.link_mut().feed(&encode_ack(4, &table).unwrap());
        assert_eq!(fsm.run_once().unwrap(), Some(MAJOR_KEY_ACK));
        assert!(fsm.link().tx.is_empty());
    }

    #[test]
    fn test_blocking_poll_times_out_partial_frame() {
        let table = ChecksumTable::new();
        let bytes = encode_frame(4, 0, b"abcdef", table.slot(4)).unwrap();
        let mut fsm = echo_fsm();
        fsm.link_mut().feed(&bytes[..5]);

        assert_eq!(fsm.poll_blocking().unwrap(), None);
        assert_eq!(fsm.stats().stage_timeouts, 1);
        assert_eq!(fsm.stage(), Stage::ReadKeys);

        fsm.link_mut().feed(&bytes);
        assert_eq!(fsm.poll_blocking().unwrap(), Some(4));
    }

    #[test]
    fn test_blocking_poll_quiet_link() {
        let mut fsm = echo_fsm();
        assert_eq!(fsm.poll_blocking().unwrap(), None);
        assert_eq!(fsm.stats().stage_timeouts, 0);
    }

    #[test]
    fn test_signal_ready() {
        let mut fsm = echo_fsm();
        fsm.signal_ready().unwrap();
        assert_eq!(sent_frames(&fsm)[0].major_key, MAJOR_KEY_DEVICE_READY);
    }

    #[test]
    fn test_wider_checksum_on_device() {
        let mut table = ChecksumTable::new();
        table.configure(4, ChecksumConfig::new(ChecksumKind::Crc16Poly, 0xFFFF).build().unwrap()).unwrap();
        let mut fsm = DeviceFsm::with_config(MemLink::default(), table.clone(), DeviceConfig::default());
        fsm.register(4, |_: u8, _: &[u8], _: &mut Replies| Ok(()));
        fsm.link_mut()
            .feed(&encode_frame(4, 0, b"x", table.slot(4)).unwrap());
        assert_eq!(fsm.run_once().unwrap(), Some(4));
    }
}
