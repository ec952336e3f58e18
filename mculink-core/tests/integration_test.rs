//! Host encoder → device state machine → host decoder

use mculink_core::{
    checksum::ChecksumTable,
    constants::{MAJOR_KEY_ERROR, MAJOR_KEY_IO, MAJOR_KEY_PROGRAMMER},
    decoder::decode_all,
    device::{DeviceError, DeviceFsm, DeviceLink, Replies},
    encoder::{encode_frame, encode_packet_markers},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::VecDeque;

#[derive(Default)]
struct Wire {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl DeviceLink for Wire {
    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        self.tx.extend_from_slice(bytes);
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        0
    }
}

#[test]
fn test_stream_in_random_slices() {
    let table = ChecksumTable::new();
    let mut stream = Vec::new();
    let mut expected = Vec::new();
    for i in 0..50u32 {
        let payload: Vec<u8> = (0..(i * 37) % 700).map(|b| b as u8).collect();
        stream.extend_from_slice(&encode_frame(MAJOR_KEY_IO, i as u8, &payload, table.slot(4)).unwrap());
        expected.push(payload);
    }

    let mut fsm = DeviceFsm::new(Wire::default());
    let received = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = received.clone();
    fsm.register(MAJOR_KEY_IO, move |_: u8, payload: &[u8], _: &mut Replies| {
        sink.borrow_mut().push(payload.to_vec());
        Ok(())
    });

    let mut rng = StdRng::seed_from_u64(7);
    let mut offset = 0;
    while offset < stream.len() {
        let n = rng.gen_range(1..64).min(stream.len() - offset);
        fsm.link_mut().rx.extend(stream[offset..offset + n].iter().copied());
        offset += n;
        while fsm.run_once().unwrap().is_some() {}
    }

    assert_eq!(*received.borrow(), expected);

    let (acks, used) = decode_all(&fsm.link().tx, &table).unwrap();
    assert_eq!(used, fsm.link().tx.len());
    assert_eq!(acks.len(), 50);
    assert!(acks.iter().all(|f| f.acked_key() == Some(MAJOR_KEY_IO)));
}

#[test]
fn test_packet_markers_reach_handler() {
    let table = ChecksumTable::new();
    let (start, end) = encode_packet_markers(MAJOR_KEY_PROGRAMMER, 2, 4, &table).unwrap();
    let body = encode_frame(MAJOR_KEY_PROGRAMMER, 2, &[1, 2, 3, 4], table.slot(6)).unwrap();

    let mut fsm = DeviceFsm::new(Wire::default());
    let minors = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = minors.clone();
    fsm.register(MAJOR_KEY_PROGRAMMER, move |minor: u8, _: &[u8], _: &mut Replies| {
        sink.borrow_mut().push(minor);
        Ok(())
    });

    for frame in [start, body, end] {
        fsm.link_mut().rx.extend(frame.iter().copied());
    }
    while fsm.run_once().unwrap().is_some() {}

    assert_eq!(*minors.borrow(), vec![0xFE, 2, 0xFF]);
}

#[test]
fn test_handler_error_propagates() {
    let table = ChecksumTable::new();
    let mut fsm = DeviceFsm::new(Wire::default());
    fsm.register(MAJOR_KEY_IO, |_: u8, _: &[u8], _: &mut Replies| {
        Err(DeviceError::Link("peripheral fault".into()))
    });
    fsm.link_mut()
        .rx
        .extend(encode_frame(MAJOR_KEY_IO, 0, b"x", table.slot(4)).unwrap().iter().copied());

    assert!(matches!(fsm.run_once(), Err(DeviceError::Link(_))));
    // The failed frame is not acknowledged, and no error ack goes out either
    let (frames, _) = decode_all(&fsm.link().tx, &table).unwrap();
    assert!(frames.iter().all(|f| f.acked_key() != Some(MAJOR_KEY_ERROR)));
}
