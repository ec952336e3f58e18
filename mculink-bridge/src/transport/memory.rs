//! In-memory transport
//!
//! [`MemoryTransport::new`] returns the transport plus a [`MemoryPeer`] that
//! plays the device: it sees every write and can inject inbound bytes or a
//! disconnect.

use super::{Transport, TransportEvent, TRANSPORT_EVENT_CAPACITY};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

struct Shared {
    connected: AtomicBool,
    events: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    log: StdMutex<Vec<u8>>,
}

impl Shared {
    fn event_sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.events.lock().ok().and_then(|g| g.clone())
    }
}

/// Transport end handed to the bridge
pub struct MemoryTransport {
    shared: Arc<Shared>,
    writes: Mutex<mpsc::UnboundedSender<Bytes>>,
}

/// Device end used by tests and embedders
pub struct MemoryPeer {
    shared: Arc<Shared>,
    writes: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    /// Create a connected pair
    pub fn new() -> (Self, MemoryPeer) {
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            events: StdMutex::new(None),
            log: StdMutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: shared.clone(),
                writes: Mutex::new(tx),
            },
            MemoryPeer { shared, writes: rx },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        if let Ok(mut events) = self.shared.events.lock() {
            *events = Some(tx);
        }
        self.shared.connected.store(true, Ordering::Release);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.shared.connected.store(false, Ordering::Release);
        if let Ok(mut events) = self.shared.events.lock() {
            events.take();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let writes = self.writes.lock().await;
        if let Ok(mut log) = self.shared.log.lock() {
            log.extend_from_slice(bytes);
        }
        // The peer may have been dropped; the log still records the write
        let _ = writes.send(Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryPeer {
    /// Next write made by the bridge, in order
    pub async fn next_write(&mut self) -> Option<Bytes> {
        self.writes.recv().await
    }

    /// A write that is already waiting, if any
    pub fn try_next_write(&mut self) -> Option<Bytes> {
        self.writes.try_recv().ok()
    }

    /// Deliver bytes to the bridge as if they came off the wire
    pub async fn inject(&self, bytes: impl Into<Bytes>) -> Result<()> {
        let tx = self.shared.event_sender().ok_or(BridgeError::NotConnected)?;
        tx.send(TransportEvent::Data(bytes.into()))
            .await
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Simulate the link dropping
    pub async fn disconnect(&self, reason: &str) -> Result<()> {
        let tx = self.shared.event_sender().ok_or(BridgeError::NotConnected)?;
        self.shared.connected.store(false, Ordering::Release);
        if let Ok(mut events) = self.shared.events.lock() {
            events.take();
        }
        tx.send(TransportEvent::Disconnected(reason.to_string()))
            .await
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Every byte written so far
    pub fn written(&self) -> Vec<u8> {
        self.shared.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Whether the bridge side has the link open
    pub fn is_open(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}
