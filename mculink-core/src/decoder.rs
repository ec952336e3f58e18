//! Frame decoding (incremental, strict)

use crate::checksum::ChecksumTable;
use crate::constants::{LengthSelector, KEY_HEADER_SIZE, MAJOR_KEY_MASK, SELECTOR_SHIFT};
use crate::cursor::ByteCursor;
use crate::error::FrameError;
use crate::types::{DecodeResult, Frame};
use bytes::Bytes;

/// Parsed key header: byte 0 and the minor key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHeader {
    /// Major key (low 6 bits of byte 0)
    pub major_key: u8,
    /// Length field width (high 2 bits of byte 0)
    pub selector: LengthSelector,
    /// Minor key
    pub minor_key: u8,
}

impl KeyHeader {
    /// Split the two key bytes
    pub fn parse(byte0: u8, minor_key: u8) -> Self {
        Self {
            major_key: byte0 & MAJOR_KEY_MASK,
            selector: LengthSelector::from_code(byte0 >> SELECTOR_SHIFT),
            minor_key,
        }
    }
}

/// Decode one frame from the head of `buf`
///
/// Never blocks and never consumes: the caller drops `consumed` bytes on
/// success, waits for more data on [`DecodeResult::NeedMoreBytes`], and must
/// discard the whole buffer on [`DecodeResult::Invalid`] because a corrupted
/// length field leaves no trustworthy frame boundary.
pub fn decode_frame(buf: &[u8], checksums: &ChecksumTable) -> DecodeResult {
    let mut cursor = ByteCursor::new(buf);

    // Keys
    let keys = match cursor.take(KEY_HEADER_SIZE) {
        Ok(k) => KeyHeader::parse(k[0], k[1]),
        Err(_) => return need(KEY_HEADER_SIZE),
    };

    // Length field
    let width = keys.selector.width();
    let payload_len = match cursor.be_uint(width) {
        Ok(len) => len as usize,
        Err(_) => return need(KEY_HEADER_SIZE + width),
    };

    // Payload
    let payload_start = cursor.position();
    let slot = checksums.slot(keys.major_key);
    let checksum_size = slot.size();
    let total = payload_start + payload_len + checksum_size;
    if buf.len() < total {
        return need(total);
    }
    let payload = match cursor.take(payload_len) {
        Ok(p) => p,
        Err(e) => return DecodeResult::Invalid(e),
    };
    let covered = cursor.consumed();

    // Trailer
    let received = match cursor.take(checksum_size) {
        Ok(c) => c,
        Err(e) => return DecodeResult::Invalid(e),
    };

    if let Err(e) = slot.verify(keys.major_key, covered, received) {
        return DecodeResult::Invalid(e);
    }

    DecodeResult::Frame {
        frame: Frame::with_checksum(
            keys.major_key,
            keys.minor_key,
            Bytes::copy_from_slice(payload),
            Bytes::copy_from_slice(received),
        ),
        consumed: cursor.position(),
    }
}

/// Decode exactly one frame from a byte slice
pub fn decode_frame_from_bytes(data: &[u8], checksums: &ChecksumTable) -> Result<Frame, FrameError> {
    match decode_frame(data, checksums) {
        DecodeResult::Frame { frame, .. } => Ok(frame),
        DecodeResult::NeedMoreBytes { needed } => Err(FrameError::Truncated {
            needed,
            available: data.len(),
        }),
        DecodeResult::Invalid(e) => Err(e),
    }
}

/// Decode every complete frame in `data`, stopping at the first short or invalid one.
///
/// Returns the frames and the number of bytes they occupy.
pub fn decode_all(data: &[u8], checksums: &ChecksumTable) -> Result<(Vec<Frame>, usize), FrameError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    loop {
        match decode_frame(&data[offset..], checksums) {
            DecodeResult::Frame { frame, consumed } => {
                frames.push(frame);
                offset += consumed;
            }
            DecodeResult::NeedMoreBytes { .. } => return Ok((frames, offset)),
            DecodeResult::Invalid(e) => return Err(e),
        }
    }
}

fn need(needed: usize) -> DecodeResult {
    DecodeResult::NeedMoreBytes { needed }
}
