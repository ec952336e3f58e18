//! TCP transports: client, and a server that serves exactly one peer

use super::{pump_reader, Transport, TransportEvent, TRANSPORT_EVENT_CAPACITY};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Connected stream state shared by the client and server transports
struct Connection {
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl Connection {
    fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: StdMutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn attach(&self, stream: TcpStream, name: String) -> mpsc::Receiver<TransportEvent> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::Release);

        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let connected = self.connected.clone();
        let task = tokio::spawn(async move {
            pump_reader(read_half, tx, name).await;
            connected.store(false, Ordering::Release);
        });
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(old) = reader.replace(task) {
                old.abort();
            }
        }
        rx
    }

    async fn detach(&self) {
        self.connected.store(false, Ordering::Release);
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(task) = reader.take() {
                task.abort();
            }
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::NotConnected)?;
        writer.write_all(bytes).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// TCP client transport
pub struct TcpClientTransport {
    addr: String,
    conn: Connection,
}

impl TcpClientTransport {
    /// Client for `addr` (`host:port`); connects on open
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Connection::new(),
        }
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let stream = TcpStream::connect(&self.addr).await?;
        info!("Connected to {}", self.addr);
        Ok(self.conn.attach(stream, self.describe()).await)
    }

    async fn close(&self) -> Result<()> {
        self.conn.detach().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.conn.write(bytes).await
    }

    fn describe(&self) -> String {
        format!("tcp client {}", self.addr)
    }
}

/// TCP server transport: accepts one peer, then stops listening
pub struct TcpServerTransport {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    peer: StdMutex<Option<SocketAddr>>,
    conn: Connection,
}

impl TcpServerTransport {
    /// Bind the listening socket
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("Listening on {}", local_addr);
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            peer: StdMutex::new(None),
            conn: Connection::new(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the accepted peer
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.lock().ok().and_then(|p| *p)
    }
}

#[async_trait]
impl Transport for TcpServerTransport {
    /// Waits for the first peer. The listener is dropped once it connects,
    /// so a server transport can be opened only once.
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            BridgeError::Config(format!("{} already served its peer", self.describe()))
        })?;
        let (stream, peer) = listener.accept().await?;
        drop(listener);
        info!("Accepted peer {} on {}", peer, self.local_addr);
        if let Ok(mut slot) = self.peer.lock() {
            *slot = Some(peer);
        }
        Ok(self.conn.attach(stream, self.describe()).await)
    }

    async fn close(&self) -> Result<()> {
        self.listener.lock().await.take();
        self.conn.detach().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.conn.write(bytes).await
    }

    fn describe(&self) -> String {
        format!("tcp server {}", self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_client_server_loopback() {
        let server = Arc::new(TcpServerTransport::bind("127.0.0.1:0").await.unwrap());
        let addr = server.local_addr();

        let accept = {
            let server = server.clone();
            tokio::spawn(async move { server.open().await })
        };
        let client = TcpClientTransport::new(addr.to_string());
        let mut client_rx = client.open().await.unwrap();
        let mut server_rx = accept.await.unwrap().unwrap();
        assert!(server.peer_addr().is_some());

        client.write(b"ping").await.unwrap();
        assert_eq!(
            server_rx.recv().await,
            Some(TransportEvent::Data(Bytes::from_static(b"ping")))
        );

        server.write(b"pong").await.unwrap();
        assert_eq!(
            client_rx.recv().await,
            Some(TransportEvent::Data(Bytes::from_static(b"pong")))
        );

        // Server closing shows up as a disconnect on the client
        server.close().await.unwrap();
        assert!(matches!(
            client_rx.recv().await,
            Some(TransportEvent::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_server_serves_one_peer() {
        let server = Arc::new(TcpServerTransport::bind("127.0.0.1:0").await.unwrap());
        let addr = server.local_addr();
        let accept = {
            let server = server.clone();
            tokio::spawn(async move { server.open().await })
        };
        let _client = TcpStream::connect(addr).await.unwrap();
        accept.await.unwrap().unwrap();

        assert!(server.open().await.is_err());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_client_write_before_open() {
        let client = TcpClientTransport::new("127.0.0.1:1");
        assert!(matches!(
            client.write(b"x").await,
            Err(BridgeError::NotConnected)
        ));
    }
}
