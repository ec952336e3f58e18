//! Fixed byte vectors for the wire format
//!
//! Every vector here is the exact byte sequence a device must produce or
//! accept; they double as reference data for firmware ports.

use mculink_core::checksum::{
    ChecksumAlgorithm, ChecksumConfig, ChecksumKind, ChecksumTable, Crc16Poly, Crc16Table,
    Crc32Poly, Crc32Table, Crc8Poly, Crc8Table,
};
use mculink_core::constants::{MAJOR_KEY_ACK, MAJOR_KEY_IO};
use mculink_core::decoder::decode_frame_from_bytes;
use mculink_core::encoder::{
    encode_ack, encode_device_ready, encode_error_ack, encode_frame, encode_reset,
};

const CHECK_INPUT: &[u8] = b"123456789";

#[test]
fn crc_check_values() {
    assert_eq!(Crc8Table.compute(CHECK_INPUT, 0).unwrap(), vec![0xF4]);
    assert_eq!(Crc8Poly.compute(CHECK_INPUT, 0).unwrap(), vec![0xF4]);
    assert_eq!(Crc16Table.compute(CHECK_INPUT, 0).unwrap(), vec![0x31, 0xC3]);
    assert_eq!(Crc16Poly.compute(CHECK_INPUT, 0).unwrap(), vec![0x31, 0xC3]);
    assert_eq!(
        Crc32Table.compute(CHECK_INPUT, 0).unwrap(),
        vec![0xCB, 0xF4, 0x39, 0x26]
    );
    assert_eq!(
        Crc32Poly.compute(CHECK_INPUT, 0).unwrap(),
        vec![0xCB, 0xF4, 0x39, 0x26]
    );
}

#[test]
fn basic_chunk_crc8() {
    let table = ChecksumTable::new();
    let bytes = encode_frame(MAJOR_KEY_IO, 0, &[0x01, 0x02], table.slot(MAJOR_KEY_IO)).unwrap();
    assert_eq!(bytes.as_ref(), &[0x44, 0x00, 0x02, 0x01, 0x02, 0x8A]);

    let frame = decode_frame_from_bytes(&bytes, &table).unwrap();
    assert_eq!(frame.payload.as_ref(), &[0x01, 0x02]);
}

#[test]
fn basic_chunk_crc16_and_crc32() {
    let mut table = ChecksumTable::new();
    table.configure(
        MAJOR_KEY_IO,
        ChecksumConfig::new(ChecksumKind::Crc16Table, 0).build().unwrap(),
    ).unwrap();
    let bytes = encode_frame(MAJOR_KEY_IO, 0, &[0x01, 0x02], table.slot(MAJOR_KEY_IO)).unwrap();
    assert_eq!(&bytes[5..], &[0xE5, 0x7D]);

    table.configure(
        MAJOR_KEY_IO,
        ChecksumConfig::new(ChecksumKind::Crc32Poly, 0).build().unwrap(),
    ).unwrap();
    let bytes = encode_frame(MAJOR_KEY_IO, 0, &[0x01, 0x02], table.slot(MAJOR_KEY_IO)).unwrap();
    assert_eq!(&bytes[5..], &[0x9F, 0xC0, 0x8D, 0x97]);
}

#[test]
fn control_frames() {
    let table = ChecksumTable::new();
    assert_eq!(encode_ack(MAJOR_KEY_IO, &table).unwrap().as_ref(), &[0x02, 0x04, 0x36]);
    assert_eq!(encode_error_ack(&table).unwrap().as_ref(), &[0x02, 0x00, 0x2A]);
    assert_eq!(encode_reset(&table).unwrap().as_ref(), &[0x01, 0x00, 0x15]);
    assert_eq!(encode_device_ready(&table).unwrap().as_ref(), &[0x03, 0x00, 0x3F]);
}

#[test]
fn ack_decodes_with_acked_key() {
    let table = ChecksumTable::new();
    let frame = decode_frame_from_bytes(&[0x02, 0x04, 0x36], &table).unwrap();
    assert_eq!(frame.major_key, MAJOR_KEY_ACK);
    assert_eq!(frame.acked_key(), Some(MAJOR_KEY_IO));
}

#[test]
fn selector_boundaries() {
    let table = ChecksumTable::new();
    let slot = table.slot(5);
    for (len, byte0, width) in [
        (0usize, 0x05u8, 0usize),
        (1, 0x45, 1),
        (255, 0x45, 1),
        (256, 0x85, 2),
        (65_535, 0x85, 2),
        (65_536, 0xC5, 4),
    ] {
        let bytes = encode_frame(5, 0, &vec![0xAB; len], slot).unwrap();
        assert_eq!(bytes[0], byte0, "len {}", len);
        assert_eq!(bytes.len(), 2 + width + len + 1, "len {}", len);
    }
}
