//! Core types for mculink frames

use crate::constants::{LengthSelector, KEY_HEADER_SIZE, MAJOR_KEY_ACK, MAX_MAJOR_KEY};
use crate::error::FrameError;
use bytes::Bytes;

/// Complete mculink frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical channel selector (6 bits)
    pub major_key: u8,

    /// Sub-command within the channel; for ACK frames, the acknowledged major key
    pub minor_key: u8,

    /// Frame payload (application data)
    pub payload: Bytes,

    /// Checksum trailer as read off the wire (empty for frames built locally)
    pub checksum: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(major_key: u8, minor_key: u8, payload: Bytes) -> Self {
        Self {
            major_key,
            minor_key,
            payload,
            checksum: Bytes::new(),
        }
    }

    /// Create a frame with a known trailer
    pub fn with_checksum(major_key: u8, minor_key: u8, payload: Bytes, checksum: Bytes) -> Self {
        Self {
            major_key,
            minor_key,
            payload,
            checksum,
        }
    }

    /// Validate the frame fields
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.major_key > MAX_MAJOR_KEY {
            return Err(FrameError::InvalidMajorKey(self.major_key));
        }
        let len = self.payload.len() as u64;
        if len > crate::constants::MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(
                len,
                crate::constants::MAX_PAYLOAD_SIZE,
            ));
        }
        Ok(())
    }

    /// Length selector used for this payload
    pub fn selector(&self) -> LengthSelector {
        LengthSelector::for_len(self.payload.len() as u64)
    }

    /// Size of the encoded frame given a trailer size
    pub fn encoded_len(&self, checksum_size: usize) -> usize {
        KEY_HEADER_SIZE + self.selector().width() + self.payload.len() + checksum_size
    }

    /// Whether this is an acknowledgement
    pub fn is_ack(&self) -> bool {
        self.major_key == MAJOR_KEY_ACK
    }

    /// For ACK frames, the major key being acknowledged
    pub fn acked_key(&self) -> Option<u8> {
        self.is_ack().then_some(self.minor_key)
    }
}

/// Outcome of an attempt to decode one frame from the head of a buffer
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeResult {
    /// A complete, checksum-verified frame occupying `consumed` bytes
    Frame {
        /// The decoded frame
        frame: Frame,
        /// Bytes taken from the head of the buffer
        consumed: usize,
    },

    /// The buffer ends before the frame does; retry once `needed` total bytes are present
    NeedMoreBytes {
        /// Total buffer length required to make progress
        needed: usize,
    },

    /// The head of the buffer is not a valid frame; framing alignment is lost
    Invalid(FrameError),
}

impl DecodeResult {
    /// Convenience accessor for tests and tooling
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            DecodeResult::Frame { frame, .. } => Some(frame),
            _ => None,
        }
    }
}
