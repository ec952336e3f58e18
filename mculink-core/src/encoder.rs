//! Frame encoding

use crate::checksum::{ChecksumSlot, ChecksumTable};
use crate::constants::{
    LengthSelector, KEY_HEADER_SIZE, MAJOR_KEY_ACK, MAJOR_KEY_DEVICE_READY, MAJOR_KEY_ERROR,
    MAJOR_KEY_RESET, MAX_MAJOR_KEY, MAX_PAYLOAD_SIZE, MINOR_KEY_PACKET_END,
    MINOR_KEY_PACKET_START, SELECTOR_SHIFT,
};
use crate::error::FrameError;
use crate::types::Frame;
use bytes::{BufMut, Bytes, BytesMut};

/// Encode a frame into bytes
///
/// The frame is encoded with the following layout:
/// 1. Byte 0: major key (low 6 bits) | length selector code (high 2 bits)
/// 2. Byte 1: minor key
/// 3. Payload length, big-endian, 0/1/2/4 bytes per selector
/// 4. Payload (variable length)
/// 5. Checksum over everything above, size set by `checksum`
pub fn encode_frame(
    major_key: u8,
    minor_key: u8,
    payload: &[u8],
    checksum: &ChecksumSlot,
) -> Result<Bytes, FrameError> {
    if major_key > MAX_MAJOR_KEY {
        return Err(FrameError::InvalidMajorKey(major_key));
    }

    let len = payload.len() as u64;
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(len, MAX_PAYLOAD_SIZE));
    }

    let selector = LengthSelector::for_len(len);
    let total_size = KEY_HEADER_SIZE + selector.width() + payload.len() + checksum.size();
    let mut buf = BytesMut::with_capacity(total_size);

    // Write keys
    buf.put_u8(major_key | (selector.code() << SELECTOR_SHIFT));
    buf.put_u8(minor_key);

    // Write length field
    match selector {
        LengthSelector::None => {}
        LengthSelector::U8 => buf.put_u8(len as u8),
        LengthSelector::U16 => buf.put_u16(len as u16),
        LengthSelector::U32 => buf.put_u32(len as u32),
    }

    // Write payload
    buf.put_slice(payload);

    // Write trailer
    let sum = checksum.compute(&buf)?;
    buf.put_slice(&sum);

    Ok(buf.freeze())
}

/// Encode a complete Frame struct using the slot configured for its major key
pub fn encode_frame_struct(frame: &Frame, checksums: &ChecksumTable) -> Result<Bytes, FrameError> {
    frame.validate()?;
    encode_frame(
        frame.major_key,
        frame.minor_key,
        &frame.payload,
        checksums.slot(frame.major_key),
    )
}

/// Encode an acknowledgement of `acked_major`
pub fn encode_ack(acked_major: u8, checksums: &ChecksumTable) -> Result<Bytes, FrameError> {
    encode_frame(MAJOR_KEY_ACK, acked_major, &[], checksums.slot(MAJOR_KEY_ACK))
}

/// Encode an error acknowledgement (ACK carrying the error key)
pub fn encode_error_ack(checksums: &ChecksumTable) -> Result<Bytes, FrameError> {
    encode_ack(MAJOR_KEY_ERROR, checksums)
}

/// Encode a reset request
pub fn encode_reset(checksums: &ChecksumTable) -> Result<Bytes, FrameError> {
    encode_frame(MAJOR_KEY_RESET, 0, &[], checksums.slot(MAJOR_KEY_RESET))
}

/// Encode a device-ready signal
pub fn encode_device_ready(checksums: &ChecksumTable) -> Result<Bytes, FrameError> {
    encode_frame(
        MAJOR_KEY_DEVICE_READY,
        0,
        &[],
        checksums.slot(MAJOR_KEY_DEVICE_READY),
    )
}

/// Payload of the marker opening a packeted transfer
pub fn packet_start_payload(inner_minor: u8, total_len: u32) -> [u8; 5] {
    let len = total_len.to_be_bytes();
    [inner_minor, len[0], len[1], len[2], len[3]]
}

/// Marker frames around a packeted transfer: (start, end)
pub fn encode_packet_markers(
    major_key: u8,
    inner_minor: u8,
    total_len: u32,
    checksums: &ChecksumTable,
) -> Result<(Bytes, Bytes), FrameError> {
    let slot = checksums.slot(major_key);
    let start = encode_frame(
        major_key,
        MINOR_KEY_PACKET_START,
        &packet_start_payload(inner_minor, total_len),
        slot,
    )?;
    let end = encode_frame(major_key, MINOR_KEY_PACKET_END, &[inner_minor], slot)?;
    Ok((start, end))
}

/// Builder for constructing frames
pub struct FrameBuilder {
    major_key: u8,
    minor_key: u8,
    payload: Bytes,
}

impl FrameBuilder {
    /// Create a new frame builder
    pub fn new(major_key: u8) -> Self {
        Self {
            major_key,
            minor_key: 0,
            payload: Bytes::new(),
        }
    }

    /// Set the minor key
    pub fn minor(mut self, minor_key: u8) -> Self {
        self.minor_key = minor_key;
        self
    }

    /// Set the payload
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Build and encode the frame
    pub fn build(self, checksums: &ChecksumTable) -> Result<Bytes, FrameError> {
        encode_frame(
            self.major_key,
            self.minor_key,
            &self.payload,
            checksums.slot(self.major_key),
        )
    }

    /// Build the frame struct without encoding
    pub fn build_struct(self) -> Result<Frame, FrameError> {
        let frame = Frame::new(self.major_key, self.minor_key, self.payload);
        frame.validate()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{ChecksumAlgorithm, Crc8Table};

    #[test]
    fn test_encode_basic_chunk() {
        let table = ChecksumTable::new();
        let encoded = encode_frame(4, 0, &[0x01, 0x02], table.slot(4)).unwrap();

        let crc = Crc8Table.compute(&[0x44, 0x00, 0x02, 0x01, 0x02], 0).unwrap();
        // Byte 0 carries selector code 1 in the top bits
        assert_eq!(&encoded[..5], &[0x44, 0x00, 0x02, 0x01, 0x02]);
        assert_eq!(&encoded[5..], crc.as_slice());
    }

    #[test]
    fn test_encode_frame_struct_matches_encode_frame() {
        let table = ChecksumTable::new();
        let frame = Frame::new(4, 0, Bytes::from_static(&[0x01, 0x02]));
        assert_eq!(
            encode_frame_struct(&frame, &table).unwrap(),
            encode_frame(4, 0, &[0x01, 0x02], table.slot(4)).unwrap()
        );

        let wide = Frame::new(70, 0, Bytes::new());
        assert!(encode_frame_struct(&wide, &table).is_err());
    }

    #[test]
    fn test_encode_empty_payload_has_no_length() {
        let table = ChecksumTable::new();
        let encoded = encode_ack(4, &table).unwrap();
        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded[0], MAJOR_KEY_ACK);
        assert_eq!(encoded[1], 4);
    }

    #[test]
    fn test_encode_rejects_wide_major_key() {
        let table = ChecksumTable::new();
        let err = encode_frame(64, 0, b"x", table.slot(0)).unwrap_err();
        assert_eq!(err, FrameError::InvalidMajorKey(64));
    }

    #[test]
    fn test_length_field_widths() {
        let table = ChecksumTable::new();
        let slot = table.slot(5);

        let f = encode_frame(5, 1, &vec![0u8; 300], slot).unwrap();
        assert_eq!(f[0] >> SELECTOR_SHIFT, 2);
        assert_eq!(&f[2..4], &300u16.to_be_bytes());

        let f = encode_frame(5, 1, &vec![0u8; 70_000], slot).unwrap();
        assert_eq!(f[0] >> SELECTOR_SHIFT, 3);
        assert_eq!(&f[2..6], &70_000u32.to_be_bytes());
    }

    #[test]
    fn test_packet_markers() {
        let table = ChecksumTable::new();
        let (start, end) = encode_packet_markers(6, 9, 1000, &table).unwrap();
        assert_eq!(start[1], MINOR_KEY_PACKET_START);
        assert_eq!(&start[3..8], &packet_start_payload(9, 1000));
        assert_eq!(end[1], MINOR_KEY_PACKET_END);
        assert_eq!(end[3], 9);
    }

    #[test]
    fn test_frame_builder() {
        let table = ChecksumTable::new();
        let encoded = FrameBuilder::new(7)
            .minor(3)
            .payload(Bytes::from_static(b"cmd"))
            .build(&table)
            .unwrap();
        assert_eq!(encoded[0] & 0x3F, 7);
        assert_eq!(encoded[1], 3);
        assert_eq!(encoded.len(), 2 + 1 + 3 + 1);
    }
}
