//! UDP transport
//!
//! Receive and send endpoints are independent: frames arrive on the local
//! socket and are sent to a fixed remote address, optionally from a second
//! local socket (some targets reply to a different port than they listen on).

use super::{Transport, TransportEvent, TRANSPORT_EVENT_CAPACITY};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const MAX_DATAGRAM: usize = 65_535;

/// UDP transport with a fixed remote
pub struct UdpTransport {
    recv: Arc<UdpSocket>,
    send: Mutex<Arc<UdpSocket>>,
    remote: SocketAddr,
    connected: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind `local` for receiving and, if given, `send_from` for sending
    pub async fn bind(local: &str, remote: &str, send_from: Option<&str>) -> Result<Self> {
        let recv = Arc::new(UdpSocket::bind(local).await?);
        let send = match send_from {
            Some(addr) => Arc::new(UdpSocket::bind(addr).await?),
            None => recv.clone(),
        };
        let remote = lookup_host(remote)
            .await?
            .next()
            .ok_or_else(|| BridgeError::Config(format!("cannot resolve {}", remote)))?;
        debug!(
            "UDP receive on {}, send to {}",
            recv.local_addr()?,
            remote
        );
        Ok(Self {
            recv,
            send: Mutex::new(send),
            remote,
            connected: Arc::new(AtomicBool::new(false)),
            reader: StdMutex::new(None),
        })
    }

    /// Local receive address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.recv.local_addr()?)
    }

    /// Remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let socket = self.recv.clone();
        let connected = self.connected.clone();
        connected.store(true, Ordering::Release);

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, _from)) => {
                        if tx
                            .send(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        connected.store(false, Ordering::Release);
                        let _ = tx.send(TransportEvent::Disconnected(e.to_string())).await;
                        return;
                    }
                }
            }
        });
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(old) = reader.replace(task) {
                old.abort();
            }
        }
        info!("{} open", self.describe());
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(task) = reader.take() {
                task.abort();
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let socket = self.send.lock().await;
        socket.send_to(bytes, self.remote).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        match self.recv.local_addr() {
            Ok(local) => format!("udp {} -> {}", local, self.remote),
            Err(_) => format!("udp -> {}", self.remote),
        }
    }
}
