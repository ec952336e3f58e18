//! Byte links the bridge runs over
//!
//! A transport is opened once and hands back a receiver of
//! [`TransportEvent`]s; writes go through `&self` and are serialized by each
//! implementation behind an async mutex.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::debug;

pub mod memory;
pub mod serial;
pub mod tcp;
pub mod udp;

pub use memory::{MemoryPeer, MemoryTransport};
pub use serial::{SerialSettings, SerialTransport};
pub use tcp::{TcpClientTransport, TcpServerTransport};
pub use udp::UdpTransport;

/// Capacity of a transport's event channel
pub const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// Size of the read buffer used by stream transports
pub(crate) const READ_BUFFER_SIZE: usize = 4096;

/// Something that happened on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived
    Data(Bytes),
    /// The link is gone; no further events follow
    Disconnected(String),
}

/// A bidirectional byte link
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and start delivering inbound events
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Disconnect; safe to call more than once
    async fn close(&self) -> Result<()>;

    /// Whether the link is up
    fn is_connected(&self) -> bool;

    /// Write all bytes
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Human-readable endpoint description for logs
    fn describe(&self) -> String;
}

/// Forward everything read from `reader` until EOF or error
pub(crate) async fn pump_reader<R>(mut reader: R, tx: mpsc::Sender<TransportEvent>, name: String)
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "peer closed the connection".to_string(),
            Ok(n) => {
                if tx
                    .send(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    debug!("{}: event receiver dropped, stopping reader", name);
                    return;
                }
            }
            Err(e) => break e.to_string(),
        }
    };
    debug!("{}: {}", name, reason);
    let _ = tx.send(TransportEvent::Disconnected(reason)).await;
}
