//! # mculink bridge
//!
//! Host side of the mculink protocol: a bridge between application channels
//! and a byte transport (serial, TCP, UDP or in-memory).
//!
//! ## Modules
//!
//! - `bridge`: Engine task, send queue, acknowledgement handling, lifecycle
//! - `channel`: Application endpoints frames are dispatched to
//! - `config`: TOML configuration
//! - `transport`: Byte links
//! - `error`: Error types
//!
//! ## Example
//!
//! ```no_run
//! use mculink_bridge::{BridgeConfig, BridgeHandle, SerialSettings, SerialTransport};
//! use std::sync::Arc;
//!
//! # async fn run() -> mculink_bridge::Result<()> {
//! let transport = Arc::new(SerialTransport::new(SerialSettings::new("/dev/ttyUSB0", 115_200)));
//! let bridge = BridgeHandle::spawn(transport, BridgeConfig::default())?;
//! bridge.open_bridge().await?;
//! let outcome = bridge.send_chunk(4, 0, vec![1u8, 2]).await;
//! assert!(outcome.is_completed());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod transport;

pub use bridge::{BridgeHandle, BridgeState, SendOutcome, SendRequest, SendTicket};
pub use channel::Channel;
pub use config::{BridgeConfig, ChannelSettings, TransportConfig};
pub use error::{BridgeError, Result};
pub use transport::{
    MemoryPeer, MemoryTransport, SerialSettings, SerialTransport, TcpClientTransport,
    TcpServerTransport, Transport, TransportEvent, UdpTransport,
};
