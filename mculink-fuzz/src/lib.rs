//! Fuzzing entry points for mculink-core
//!
//! To use with cargo-fuzz:
//! 1. Install cargo-fuzz: cargo install cargo-fuzz
//! 2. Point a fuzz target at one of these functions

use mculink_core::checksum::ChecksumTable;
use mculink_core::device::{DeviceConfig, DeviceError, DeviceFsm, DeviceLink, Replies};
use std::collections::VecDeque;

pub fn fuzz_decode(data: &[u8]) {
    use mculink_core::decoder::{decode_all, decode_frame};

    // Try to decode - should never panic
    let table = ChecksumTable::new();
    let _ = decode_frame(data, &table);
    let _ = decode_all(data, &table);
}

/// Byte source for the device state machine; writes are discarded
struct FuzzLink {
    input: VecDeque<u8>,
    clock: u64,
}

impl DeviceLink for FuzzLink {
    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn write(&mut self, _bytes: &[u8]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.clock
    }

    fn idle(&mut self) {
        self.clock += 1;
    }
}

pub fn fuzz_device_step(data: &[u8]) {
    let link = FuzzLink {
        input: data.iter().copied().collect(),
        clock: 0,
    };
    let config = DeviceConfig {
        max_payload: 4096,
        stage_timeout_ms: 5,
    };
    let mut device = DeviceFsm::with_config(link, ChecksumTable::new(), config);
    for key in 4..=8u8 {
        device.register(key, move |minor: u8, payload: &[u8], replies: &mut Replies| {
            replies.send(key, minor, payload);
            Ok::<(), DeviceError>(())
        });
    }

    // Feed everything; halting is an allowed outcome, panicking is not
    while !device.link().input.is_empty() {
        if device.run_once().is_err() {
            return;
        }
    }
    let _ = device.poll_blocking();
}
