//! # mculink Core
//!
//! Framing, checksums and the device-side state machine for a host to
//! microcontroller request/response link.
//!
//! ## Modules
//!
//! - `constants`: Major keys, length selectors and limits
//! - `types`: Core types (Frame, DecodeResult)
//! - `checksum`: CRC-8/16/32 providers, external checksum programs, per-key table
//! - `encoder`: Frame encoding and control frames
//! - `decoder`: Incremental strict decoding
//! - `payload`: Text-to-bytes payload conversion
//! - `device`: Device-side frame state machine

#![warn(missing_docs)]

pub mod checksum;
pub mod constants;
pub mod cursor;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod error;
pub mod payload;
pub mod types;

// Re-export commonly used types
pub use checksum::{ChecksumConfig, ChecksumKind, ChecksumSlot, ChecksumTable};
pub use error::FrameError;
pub use types::{DecodeResult, Frame};

/// Result type alias for mculink operations
pub type Result<T> = core::result::Result<T, FrameError>;
