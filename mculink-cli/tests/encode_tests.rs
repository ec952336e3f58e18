use mculink_cli::commands::encode::{self, EncodeArgs};
use mculink_cli::ChecksumArg;
use mculink_core::checksum::ChecksumTable;
use mculink_core::constants::{MINOR_KEY_PACKET_END, MINOR_KEY_PACKET_START};
use mculink_core::decoder::decode_all;
use mculink_core::encoder::encode_frame;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_encode_basic_chunk() {
    let bytes = encode::encode_frames(&EncodeArgs::new(4, 0, "0102")).unwrap();
    assert_eq!(bytes, vec![0x44, 0x00, 0x02, 0x01, 0x02, 0x8A]);
}

#[test]
fn test_encode_with_crc16() {
    let mut args = EncodeArgs::new(4, 0, "0102");
    args.checksum = ChecksumArg::Crc16;
    let bytes = encode::encode_frames(&args).unwrap();
    assert_eq!(&bytes[5..], &[0xE5, 0x7D]);
}

#[test]
fn test_encode_empty_payload() {
    let mut args = EncodeArgs::new(1, 0, "");
    args.hex = None;
    let bytes = encode::encode_frames(&args).unwrap();
    assert_eq!(bytes, vec![0x01, 0x00, 0x15]);
}

#[test]
fn test_encode_file_chunked_and_packeted() {
    let td = tempdir().unwrap();
    let input_path = td.path().join("payload.bin");
    let output_path = td.path().join("frames.bin");
    fs::write(&input_path, vec![0x5A; 100]).unwrap();

    let mut args = EncodeArgs::new(6, 2, "");
    args.hex = None;
    args.input = Some(input_path.to_string_lossy().to_string());
    args.output = Some(output_path.to_string_lossy().to_string());
    args.chunk_size = 40;
    args.packeted = true;
    encode::execute(&args).unwrap();

    let data = fs::read(&output_path).unwrap();
    let (frames, consumed) = decode_all(&data, &ChecksumTable::new()).unwrap();
    assert_eq!(consumed, data.len());
    let minors: Vec<u8> = frames.iter().map(|f| f.minor_key).collect();
    assert_eq!(minors, vec![MINOR_KEY_PACKET_START, 2, 2, 2, MINOR_KEY_PACKET_END]);
    assert_eq!(frames[0].payload.as_ref(), &[2, 0, 0, 0, 100]);
    assert_eq!(frames[3].payload.len(), 20);
}

#[test]
fn test_encode_text_payload() {
    let mut args = EncodeArgs::new(4, 1, "");
    args.hex = Some(hex::encode("10 20 255"));
    args.base = Some(10);
    let bytes = encode::encode_frames(&args).unwrap();
    let (frames, _) = decode_all(&bytes, &ChecksumTable::new()).unwrap();
    assert_eq!(frames[0].payload.as_ref(), &[10, 20, 255]);
}

#[test]
fn test_encode_rejects_bad_input() {
    assert!(encode::encode_frames(&EncodeArgs::new(64, 0, "01")).is_err());
    assert!(encode::encode_frames(&EncodeArgs::new(4, 0, "xyz")).is_err());

    let mut args = EncodeArgs::new(4, 0, "");
    args.hex = Some(hex::encode("1 2 300"));
    args.base = Some(10);
    assert!(encode::encode_frames(&args).is_err());
}

#[test]
fn test_encode_chunks_with_key_checksum() {
    let mut args = EncodeArgs::new(9, 3, "0102030405");
    args.checksum = ChecksumArg::Crc32;
    args.start = 7;
    args.chunk_size = 2;
    let bytes = encode::encode_frames(&args).unwrap();

    let table = mculink_cli::checksum_table(9, ChecksumArg::Crc32, 7).unwrap();
    let mut expected = Vec::new();
    for piece in [&[1u8, 2][..], &[3, 4], &[5]] {
        expected.extend_from_slice(&encode_frame(9, 3, piece, table.slot(9)).unwrap());
    }
    assert_eq!(bytes, expected);

    let (frames, consumed) = decode_all(&bytes, &table).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(frames.len(), 3);
}
