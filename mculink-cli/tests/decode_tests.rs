use mculink_cli::commands::decode::{self, DecodedFrame};
use mculink_cli::ChecksumArg;
use mculink_core::checksum::ChecksumTable;
use mculink_core::encoder::{encode_ack, encode_frame};
use std::fs;
use tempfile::tempdir;

fn sample_stream() -> Vec<u8> {
    let table = ChecksumTable::new();
    let mut data = Vec::new();
    data.extend_from_slice(&encode_frame(4, 0, &[1, 2], table.slot(4)).unwrap());
    data.extend_from_slice(&encode_ack(4, &table).unwrap());
    data.extend_from_slice(&encode_frame(6, 9, &[0xAB; 300], table.slot(6)).unwrap());
    data
}

#[test]
fn test_decode_to_json() {
    let td = tempdir().unwrap();
    let input_path = td.path().join("frames.bin");
    let output_path = td.path().join("frames.json");
    fs::write(&input_path, sample_stream()).unwrap();

    decode::execute(
        input_path.to_str().unwrap(),
        Some(output_path.to_str().unwrap()),
        ChecksumArg::Crc8,
        0,
    )
    .unwrap();

    let json = fs::read_to_string(&output_path).unwrap();
    let frames: Vec<DecodedFrame> = serde_json::from_str(&json).unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].payload, "0102");
    assert_eq!(frames[0].checksum, "8a");
    assert_eq!(frames[1].name, "ack");
    assert_eq!(frames[1].minor_key, 4);
    assert_eq!(frames[2].name, "programmer");
    assert_eq!(frames[2].payload_len, 300);
}

#[test]
fn test_decode_ignores_trailing_partial_frame() {
    let mut data = sample_stream();
    data.extend_from_slice(&[0x44, 0x00, 0x05, 0x01]);
    let frames = decode::decode_bytes(&data, ChecksumArg::Crc8, 0).unwrap();
    assert_eq!(frames.len(), 3);
}

#[test]
fn test_decode_rejects_corruption() {
    let mut data = sample_stream();
    data[3] ^= 0x01;
    assert!(decode::decode_bytes(&data, ChecksumArg::Crc8, 0).is_err());
}

#[test]
fn test_decode_wrong_checksum_kind_fails() {
    assert!(decode::decode_bytes(&sample_stream(), ChecksumArg::Crc32, 0).is_err());
}

#[test]
fn test_decode_missing_file() {
    let td = tempdir().unwrap();
    let missing = td.path().join("nope.bin");
    assert!(decode::execute(missing.to_str().unwrap(), None, ChecksumArg::Crc8, 0).is_err());
}
