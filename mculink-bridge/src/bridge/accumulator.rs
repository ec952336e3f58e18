//! Receive accumulator: inbound bytes in, verified frames out

use bytes::{Buf, BytesMut};
use mculink_core::constants::{LengthSelector, KEY_HEADER_SIZE, SELECTOR_SHIFT};
use mculink_core::decoder::decode_frame;
use mculink_core::{ChecksumTable, DecodeResult, Frame, FrameError};

/// Growable inbound buffer, drained one frame at a time.
///
/// Any framing failure clears the whole buffer: with a corrupt length field
/// there is no trustworthy boundary to resynchronise on.
pub(crate) struct Accumulator {
    buf: BytesMut,
    max_payload: u64,
}

impl Accumulator {
    pub(crate) fn new(max_payload: u64) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_payload,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `None` when more bytes are needed
    pub(crate) fn next_frame(&mut self, checksums: &ChecksumTable) -> Option<Result<Frame, FrameError>> {
        if let Err(e) = self.check_declared_len() {
            self.clear();
            return Some(Err(e));
        }
        match decode_frame(&self.buf, checksums) {
            DecodeResult::Frame { frame, consumed } => {
                self.buf.advance(consumed);
                Some(Ok(frame))
            }
            DecodeResult::NeedMoreBytes { .. } => None,
            DecodeResult::Invalid(e) => {
                self.clear();
                Some(Err(e))
            }
        }
    }

    /// Refuse to wait for a payload larger than the configured ceiling
    fn check_declared_len(&self) -> Result<(), FrameError> {
        if self.buf.len() < KEY_HEADER_SIZE {
            return Ok(());
        }
        let selector = LengthSelector::from_code(self.buf[0] >> SELECTOR_SHIFT);
        let width = selector.width();
        if self.buf.len() < KEY_HEADER_SIZE + width {
            return Ok(());
        }
        let declared = self.buf[KEY_HEADER_SIZE..KEY_HEADER_SIZE + width]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64);
        if declared > self.max_payload {
            return Err(FrameError::PayloadTooLarge(declared, self.max_payload));
        }
        Ok(())
    }
}
