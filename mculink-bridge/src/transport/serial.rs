//! Serial port transport
//!
//! The port is read on a dedicated blocking thread with a short read timeout;
//! opens and writes go through `spawn_blocking`. A watcher task polls the system port list and reports a disconnect when
//! the configured port disappears (USB adapters unplugged mid-session rarely
//! produce a read error on every platform).

use super::{Transport, TransportEvent, READ_BUFFER_SIZE, TRANSPORT_EVENT_CAPACITY};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Serial link parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Port name
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Watcher poll interval
    pub poll_interval: Duration,
    /// Read timeout of the blocking reader
    pub read_timeout: Duration,
}

impl SerialSettings {
    /// 8N1 at `baud_rate`
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            poll_interval: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
            read_timeout: Duration::from_millis(10),
        }
    }

    /// Set the watcher poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

type SharedPort = Arc<StdMutex<Option<Box<dyn SerialPort>>>>;

fn lock_port(port: &StdMutex<Option<Box<dyn SerialPort>>>) -> MutexGuard<'_, Option<Box<dyn SerialPort>>> {
    port.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_failed(e: JoinError) -> BridgeError {
    BridgeError::Io(std::io::Error::new(ErrorKind::Other, e))
}

/// One open of the port: the reader thread and watcher stop when `alive` drops
struct Session {
    alive: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl Session {
    fn end(self) {
        self.alive.store(false, Ordering::Release);
        self.watcher.abort();
    }
}

/// Serial port transport built on the `serialport` crate.
///
/// All port I/O runs on blocking threads so a slow UART never stalls the
/// runtime.
pub struct SerialTransport {
    settings: SerialSettings,
    port: SharedPort,
    write_lock: Mutex<()>,
    session: Mutex<Option<Session>>,
}

impl SerialTransport {
    /// Create an unopened transport
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: Arc::new(StdMutex::new(None)),
            write_lock: Mutex::new(()),
            session: Mutex::new(None),
        }
    }

    /// Names of the serial ports present on this machine
    pub fn available_ports() -> Result<Vec<String>> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect())
    }
}

/// End the session and drop the port; true only for the first caller
fn mark_gone(alive: &AtomicBool, port: &SharedPort) -> bool {
    if !alive.swap(false, Ordering::AcqRel) {
        return false;
    }
    lock_port(port).take();
    true
}

fn read_loop(
    mut reader: Box<dyn SerialPort>,
    port: SharedPort,
    tx: mpsc::Sender<TransportEvent>,
    alive: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    while alive.load(Ordering::Acquire) {
        match reader.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if tx
                    .blocking_send(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => {
                if mark_gone(&alive, &port) {
                    let reason = format!("serial read failed: {}", e);
                    let _ = tx.blocking_send(TransportEvent::Disconnected(reason));
                }
                return;
            }
        }
    }
}

async fn watch_port(
    name: String,
    interval: Duration,
    alive: Arc<AtomicBool>,
    port: SharedPort,
    tx: mpsc::Sender<TransportEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !alive.load(Ordering::Acquire) {
            return;
        }
        let wanted = name.clone();
        let present = tokio::task::spawn_blocking(move || {
            serialport::available_ports()
                .map(|ports| ports.iter().any(|p| p.port_name == wanted))
                // Enumeration failures are not a disconnect
                .unwrap_or(true)
        })
        .await
        .unwrap_or(true);
        if !present && mark_gone(&alive, &port) {
            warn!("Serial port {} disappeared", name);
            let _ = tx
                .send(TransportEvent::Disconnected(format!("{} removed", name)))
                .await;
            return;
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            debug!("Reopening serial port {}", self.settings.port);
            old.end();
        }

        let s = self.settings.clone();
        let (port, reader) = tokio::task::spawn_blocking(move || -> Result<(Box<dyn SerialPort>, Box<dyn SerialPort>)> {
            let port = serialport::new(&s.port, s.baud_rate)
                .timeout(s.read_timeout)
                .open()?;
            let _ = port.clear(serialport::ClearBuffer::All);
            let reader = port.try_clone()?;
            Ok((port, reader))
        })
        .await
        .map_err(join_failed)??;
        *lock_port(&self.port) = Some(port);

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);

        let thread_alive = alive.clone();
        let thread_port = self.port.clone();
        let reader_tx = tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("mculink-serial-{}", self.settings.port))
            .spawn(move || read_loop(reader, thread_port, reader_tx, thread_alive));
        if let Err(e) = spawned {
            lock_port(&self.port).take();
            return Err(e.into());
        }

        let watcher = tokio::spawn(watch_port(
            self.settings.port.clone(),
            self.settings.poll_interval,
            alive.clone(),
            self.port.clone(),
            tx,
        ));
        *session = Some(Session { alive, watcher });

        info!(
            "Opened serial port {} at {} baud",
            self.settings.port, self.settings.baud_rate
        );
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        if let Some(session) = self.session.lock().await.take() {
            session.end();
        }
        if lock_port(&self.port).take().is_some() {
            debug!("Closed serial port {}", self.settings.port);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock_port(&self.port).is_some()
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        // Held across the blocking write so frames never interleave
        let _serial = self.write_lock.lock().await;
        let port = self.port.clone();
        let data = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = lock_port(&port);
            let port = guard.as_mut().ok_or(BridgeError::NotConnected)?;
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(join_failed)?
    }

    fn describe(&self) -> String {
        format!("serial {} @ {}", self.settings.port, self.settings.baud_rate)
    }
}
