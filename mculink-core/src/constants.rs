//! Constants and limits for the mculink frame format

use serde::{Deserialize, Serialize};

/// Error / unrecognized key. Also carried in the minor key of an error acknowledgement.
pub const MAJOR_KEY_ERROR: u8 = 0;

/// Reset request. Clears all queued traffic on both ends once acknowledged.
pub const MAJOR_KEY_RESET: u8 = 1;

/// Acknowledgement. The minor key carries the major key being acknowledged.
pub const MAJOR_KEY_ACK: u8 = 2;

/// Device-originated readiness signal used to pace transfers
pub const MAJOR_KEY_DEVICE_READY: u8 = 3;

/// IO control channel (pin states, analog values)
pub const MAJOR_KEY_IO: u8 = 4;

/// Raw data transmit channel
pub const MAJOR_KEY_DATA_TRANSMIT: u8 = 5;

/// Programmer channel (firmware upload)
pub const MAJOR_KEY_PROGRAMMER: u8 = 6;

/// Custom command channel
pub const MAJOR_KEY_CUSTOM_CMD: u8 = 7;

/// General settings channel; its checksum slot is the fallback for unknown keys
pub const MAJOR_KEY_GENERAL_SETTINGS: u8 = 8;

/// Largest encodable major key (6 bits)
pub const MAX_MAJOR_KEY: u8 = 0x3F;

/// Number of major key slots
pub const MAJOR_KEY_COUNT: usize = MAX_MAJOR_KEY as usize + 1;

/// Mask of the major key bits in byte 0
pub const MAJOR_KEY_MASK: u8 = 0x3F;

/// Shift of the length-size selector inside byte 0
pub const SELECTOR_SHIFT: u8 = 6;

/// Size of the key header (byte 0 + minor key)
pub const KEY_HEADER_SIZE: usize = 2;

/// Minor key of the marker frame opening a packeted transfer.
/// Payload: `[inner_minor, total_len (u32 BE)]`.
pub const MINOR_KEY_PACKET_START: u8 = 0xFE;

/// Minor key of the marker frame closing a packeted transfer. Payload: `[inner_minor]`.
pub const MINOR_KEY_PACKET_END: u8 = 0xFF;

/// Largest payload representable by the 4-byte length field
pub const MAX_PAYLOAD_SIZE: u64 = u32::MAX as u64;

/// Returns true for keys the protocol itself consumes
pub const fn is_control_key(major_key: u8) -> bool {
    matches!(
        major_key,
        MAJOR_KEY_ERROR | MAJOR_KEY_RESET | MAJOR_KEY_ACK | MAJOR_KEY_DEVICE_READY
    )
}

/// Human-readable name of a well-known major key
pub fn major_key_name(major_key: u8) -> &'static str {
    match major_key {
        MAJOR_KEY_ERROR => "error",
        MAJOR_KEY_RESET => "reset",
        MAJOR_KEY_ACK => "ack",
        MAJOR_KEY_DEVICE_READY => "device-ready",
        MAJOR_KEY_IO => "io",
        MAJOR_KEY_DATA_TRANSMIT => "data-transmit",
        MAJOR_KEY_PROGRAMMER => "programmer",
        MAJOR_KEY_CUSTOM_CMD => "custom-cmd",
        MAJOR_KEY_GENERAL_SETTINGS => "general-settings",
        _ => "channel",
    }
}

/// Width of the payload length field, stored in the top two bits of byte 0.
///
/// Only four codes fit in two bits, so code 3 stands for a 4-byte field; a
/// payload whose length would naturally need 3 bytes is written with 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LengthSelector {
    /// Empty payload, no length field
    None,
    /// 1-byte length (payload ≤ 255)
    U8,
    /// 2-byte length (payload ≤ 65535)
    U16,
    /// 4-byte length
    U32,
}

impl LengthSelector {
    /// Smallest selector able to describe `len`
    pub const fn for_len(len: u64) -> Self {
        if len == 0 {
            LengthSelector::None
        } else if len <= u8::MAX as u64 {
            LengthSelector::U8
        } else if len <= u16::MAX as u64 {
            LengthSelector::U16
        } else {
            LengthSelector::U32
        }
    }

    /// Decode the 2-bit selector code
    pub const fn from_code(code: u8) -> Self {
        match code & 0b11 {
            0 => LengthSelector::None,
            1 => LengthSelector::U8,
            2 => LengthSelector::U16,
            _ => LengthSelector::U32,
        }
    }

    /// The 2-bit code written into byte 0
    pub const fn code(&self) -> u8 {
        match self {
            LengthSelector::None => 0,
            LengthSelector::U8 => 1,
            LengthSelector::U16 => 2,
            LengthSelector::U32 => 3,
        }
    }

    /// Number of length bytes on the wire
    pub const fn width(&self) -> usize {
        match self {
            LengthSelector::None => 0,
            LengthSelector::U8 => 1,
            LengthSelector::U16 => 2,
            LengthSelector::U32 => 4,
        }
    }
}
