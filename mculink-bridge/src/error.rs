//! Error types for the host-side bridge

use crate::bridge::BridgeState;
use mculink_core::FrameError;
use thiserror::Error;

/// Errors raised by the bridge, its transports and its configuration
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Encoding or checksum failure
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Socket, file or port I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port failure
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The bridge is closed
    #[error("Bridge is closed")]
    Closed,

    /// A lifecycle call was made from a state that does not allow it
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the bridge was in
        from: BridgeState,
        /// Requested state
        to: BridgeState,
    },

    /// The transport has no open connection
    #[error("Transport not connected")]
    NotConnected,

    /// The engine task has exited
    #[error("Bridge engine has stopped")]
    EngineGone,
}

impl From<toml::de::Error> for BridgeError {
    fn from(e: toml::de::Error) -> Self {
        BridgeError::Config(e.to_string())
    }
}

/// Result alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
