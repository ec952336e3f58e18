use mculink_cli::commands::emulate::{self, EmulateArgs};
use mculink_cli::commands::send::{self, SendArgs};
use mculink_cli::LinkArgs;
use mculink_core::checksum::ChecksumTable;
use mculink_core::decoder::decode_all;
use mculink_core::device::DeviceStats;
use mculink_core::encoder::{encode_ack, encode_frame, encode_reset};
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::tempdir;

/// Start an emulated device on a loopback port
fn spawn_device(args: EmulateArgs) -> (String, JoinHandle<DeviceStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        emulate::serve(stream, &args).unwrap()
    });
    (addr, handle)
}

#[test]
fn test_send_chunk_to_emulated_device() {
    let (addr, device) = spawn_device(EmulateArgs::default());

    send::execute(&SendArgs::hex(LinkArgs::tcp(&addr), 4, 1, "0102")).unwrap();

    let stats = device.join().unwrap();
    assert_eq!(stats.frames_dispatched, 1);
    assert_eq!(stats.checksum_errors, 0);
}

#[test]
fn test_send_packeted_file_after_reset() {
    let td = tempdir().unwrap();
    let path = td.path().join("firmware.bin");
    fs::write(&path, vec![0x3C; 5000]).unwrap();

    let (addr, device) = spawn_device(EmulateArgs {
        no_echo: true,
        ..Default::default()
    });

    let mut args = SendArgs::file(LinkArgs::tcp(&addr), 6, 0, &path);
    args.packeted = true;
    args.chunk_size = Some(512);
    args.reset_first = true;
    send::execute(&args).unwrap();

    let stats = device.join().unwrap();
    assert_eq!(stats.resets, 1);
    // Start marker, ten data frames, end marker
    assert_eq!(stats.frames_dispatched, 12);
}

#[test]
fn test_paced_send() {
    let (addr, device) = spawn_device(EmulateArgs {
        paced: true,
        no_echo: true,
        ..Default::default()
    });

    let mut args = SendArgs::hex(LinkArgs::tcp(&addr), 5, 0, &"ab".repeat(64));
    args.chunk_size = Some(16);
    args.paced = true;
    send::execute(&args).unwrap();

    assert_eq!(device.join().unwrap().frames_dispatched, 4);
}

#[test]
fn test_device_answers_raw_frames() {
    let (addr, device) = spawn_device(EmulateArgs::default());
    let table = ChecksumTable::new();
    let mut host = TcpStream::connect(&addr).unwrap();
    host.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // A reset, then a frame for a key nobody handles, then an echoed frame
    host.write_all(&encode_reset(&table).unwrap()).unwrap();
    host.write_all(&encode_frame(20, 0, &[1], table.slot(20)).unwrap())
        .unwrap();
    host.write_all(&encode_frame(7, 3, &[9, 9], table.slot(7)).unwrap())
        .unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&encode_ack(1, &table).unwrap());
    expected.extend_from_slice(&[0x02, 0x00, 0x2A]);
    expected.extend_from_slice(&encode_ack(7, &table).unwrap());

    let mut received = vec![0u8; expected.len()];
    host.read_exact(&mut received).unwrap();
    assert_eq!(received, expected);
    drop(host);

    let stats = device.join().unwrap();
    assert_eq!(stats.resets, 1);
    assert_eq!(stats.unknown_keys, 1);
    assert_eq!(stats.frames_dispatched, 1);
}

#[test]
fn test_echo_reply_follows_ack() {
    let (addr, device) = spawn_device(EmulateArgs::default());
    let table = ChecksumTable::new();
    let mut host = TcpStream::connect(&addr).unwrap();
    host.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    host.write_all(&encode_frame(4, 2, &[0xAA, 0xBB], table.slot(4)).unwrap())
        .unwrap();

    let mut received = vec![0u8; 3 + 6];
    host.read_exact(&mut received).unwrap();
    let (frames, consumed) = decode_all(&received, &table).unwrap();
    assert_eq!(consumed, received.len());
    assert_eq!((frames[0].major_key, frames[0].minor_key), (2, 4));
    assert_eq!((frames[1].major_key, frames[1].minor_key), (4, 2));
    assert_eq!(frames[1].payload.as_ref(), &[0xAA, 0xBB]);
    drop(host);

    device.join().unwrap();
}
