//! Error types for mculink frame operations

/// Errors that can occur while encoding, decoding or checksumming frames
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    /// Major key does not fit in 6 bits
    #[error("Invalid major key: {0} (must be <= 63)")]
    InvalidMajorKey(u8),

    /// Payload exceeds what the 4-byte length field can describe
    #[error("Payload size {0} exceeds maximum {1}")]
    PayloadTooLarge(u64, u64),

    /// Checksum trailer does not match the recomputed value
    #[error("Checksum mismatch on major key {major_key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Major key of the offending frame
        major_key: u8,
        /// Checksum recomputed over the frame (hex)
        expected: String,
        /// Checksum found in the trailer (hex)
        actual: String,
    },

    /// A bounded read ran past the end of the buffer
    #[error("Truncated frame: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Payload text could not be converted with the requested base
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// External checksum executable misbehaved
    #[error("External checksum failed: {0}")]
    ExternalChecksum(String),

    /// IO error during read/write
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err.to_string())
    }
}
