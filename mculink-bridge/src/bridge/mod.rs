//! The communication bridge
//!
//! One engine task per bridge owns the receive accumulator, the send queue,
//! the checksum table and the in-flight sequence. Callers hold cloneable
//! [`BridgeHandle`]s and talk to it over a channel:
//!
//! ```text
//! Channel A ─┐                                   ┌─► Transport::write
//! Channel B ─┼─► mpsc<Event> ─► Engine task ─────┤
//! Transport ─┘   (Command / Inbound / Closed)    └─► Channel callbacks
//! ```
//!
//! At most one send sequence is on the wire at a time. Each non-ACK frame
//! waits for an ACK echoing its major key and is retransmitted unchanged on
//! timeout.

mod accumulator;
pub mod ack;
mod engine;
mod job;
pub mod queue;
pub mod state;

pub use ack::{AckStatus, AckWait};
pub use queue::{SendBody, SendKind, SendRequest};
pub use state::BridgeState;

use crate::channel::Channel;
use crate::config::{BridgeConfig, ChannelSettings};
use crate::error::{BridgeError, Result};
use crate::transport::Transport;
use bytes::Bytes;
use engine::Engine;
use mculink_core::ChecksumConfig;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Final disposition of a send or reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every frame was acknowledged
    Completed,
    /// Dropped by a reset or close
    Cancelled,
    /// Could not be sent
    Failed(String),
}

impl SendOutcome {
    /// Whether the send completed
    pub fn is_completed(&self) -> bool {
        matches!(self, SendOutcome::Completed)
    }
}

/// Everything the engine reacts to
pub(crate) enum Event {
    Command(Command),
    Inbound(Bytes),
    TransportClosed(String),
}

pub(crate) enum Command {
    Send {
        request: SendRequest,
        reply: oneshot::Sender<SendOutcome>,
    },
    Reset {
        reply: oneshot::Sender<SendOutcome>,
    },
    Open {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Destroy {
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterChannel(Weak<dyn Channel>),
    DeregisterChannel(u8),
    ConfigureChecksum {
        major_key: u8,
        config: ChecksumConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    ConfigureChannel {
        settings: ChannelSettings,
        reply: oneshot::Sender<Result<()>>,
    },
    State(oneshot::Sender<BridgeState>),
    PendingLen(oneshot::Sender<usize>),
}

/// A queued send whose outcome arrives later
pub struct SendTicket {
    rx: oneshot::Receiver<SendOutcome>,
}

impl SendTicket {
    /// Wait for the outcome
    pub async fn outcome(self) -> SendOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| SendOutcome::Failed("bridge engine stopped".into()))
    }
}

/// Cloneable handle to a bridge engine
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<Event>,
}

impl BridgeHandle {
    /// Start an engine for `transport`. Must be called inside a tokio runtime.
    ///
    /// The bridge starts closed; call [`open_bridge`](Self::open_bridge).
    pub fn spawn(transport: Arc<dyn Transport>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let checksums = config.checksum_table()?;
        let (tx, rx) = mpsc::channel(config.event_capacity);
        debug!("Spawning bridge engine for {}", transport.describe());
        tokio::spawn(Engine::new(transport, config, checksums, rx).run());
        Ok(Self { tx })
    }

    async fn command<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Command(make(reply)))
            .await
            .map_err(|_| BridgeError::EngineGone)?;
        rx.await.map_err(|_| BridgeError::EngineGone)
    }

    async fn notify(&self, event: Event) -> Result<()> {
        self.tx.send(event).await.map_err(|_| BridgeError::EngineGone)
    }

    /// Queue `request` and return at once
    pub async fn submit(&self, request: SendRequest) -> SendTicket {
        let (reply, rx) = oneshot::channel();
        // If the engine is gone the reply sender is dropped and the ticket fails
        let _ = self
            .tx
            .send(Event::Command(Command::Send { request, reply }))
            .await;
        SendTicket { rx }
    }

    /// Queue `request` and wait for its outcome
    pub async fn send(&self, request: SendRequest) -> SendOutcome {
        self.submit(request).await.outcome().await
    }

    /// Send one payload
    pub async fn send_chunk(&self, major_key: u8, minor_key: u8, payload: impl Into<Bytes>) -> SendOutcome {
        self.send(SendRequest::chunk(major_key, minor_key, payload)).await
    }

    /// Send one payload between packet markers
    pub async fn send_chunk_packeted(
        &self,
        major_key: u8,
        minor_key: u8,
        payload: impl Into<Bytes>,
    ) -> SendOutcome {
        self.send(SendRequest::chunk(major_key, minor_key, payload).packeted())
            .await
    }

    /// Send a file
    pub async fn send_file(&self, major_key: u8, minor_key: u8, path: impl Into<PathBuf>) -> SendOutcome {
        self.send(SendRequest::file(major_key, minor_key, path)).await
    }

    /// Send a file between packet markers
    pub async fn send_file_packeted(
        &self,
        major_key: u8,
        minor_key: u8,
        path: impl Into<PathBuf>,
    ) -> SendOutcome {
        self.send(SendRequest::file(major_key, minor_key, path).packeted())
            .await
    }

    /// Cancel all traffic and reset the peer
    pub async fn reset_remote(&self) -> SendOutcome {
        self.command(|reply| Command::Reset { reply })
            .await
            .unwrap_or_else(|e| SendOutcome::Failed(e.to_string()))
    }

    /// Feed inbound bytes, as if read from the transport
    pub async fn receive(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.notify(Event::Inbound(bytes.into())).await
    }

    /// Report that the link went away
    pub async fn transport_closed(&self, reason: impl Into<String>) -> Result<()> {
        self.notify(Event::TransportClosed(reason.into())).await
    }

    /// Open the transport and start accepting sends
    pub async fn open_bridge(&self) -> Result<()> {
        self.command(|reply| Command::Open { reply }).await?
    }

    /// Cancel everything and close the transport; a no-op when closed
    pub async fn close_bridge(&self) -> Result<()> {
        self.command(|reply| Command::Close { reply }).await?
    }

    /// Close and stop the engine. The handle is unusable afterwards.
    pub async fn destroy_bridge(&self) -> Result<()> {
        self.command(|reply| Command::Destroy { reply }).await?
    }

    /// Dispatch frames for the channel's key (and all keys if it accepts all)
    pub async fn register_channel(&self, channel: Arc<dyn Channel>) -> Result<()> {
        self.notify(Event::Command(Command::RegisterChannel(Arc::downgrade(&channel))))
            .await
    }

    /// Stop dispatching to the channel on `major_key`
    pub async fn deregister_channel(&self, major_key: u8) -> Result<()> {
        self.notify(Event::Command(Command::DeregisterChannel(major_key)))
            .await
    }

    /// Replace the checksum for `major_key`
    pub async fn configure_checksum(&self, major_key: u8, config: ChecksumConfig) -> Result<()> {
        self.command(|reply| Command::ConfigureChecksum {
            major_key,
            config,
            reply,
        })
        .await?
    }

    /// Replace chunking, pacing and checksum settings for a key
    pub async fn configure_channel(&self, settings: ChannelSettings) -> Result<()> {
        self.command(|reply| Command::ConfigureChannel { settings, reply })
            .await?
    }

    /// Current lifecycle state
    pub async fn state(&self) -> Result<BridgeState> {
        self.command(Command::State).await
    }

    /// Sends waiting behind the in-flight one
    pub async fn pending_len(&self) -> Result<usize> {
        self.command(Command::PendingLen).await
    }
}
