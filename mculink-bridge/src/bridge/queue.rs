//! Send requests and the FIFO of pending sends

use super::SendOutcome;
use crate::channel::Channel;
use bytes::Bytes;
use mculink_core::payload::PayloadEncoding;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Shape of a send sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendKind {
    /// One payload
    Chunk,
    /// One payload between packet start/end markers
    ChunkPacketed,
    /// A file, split into frames
    File,
    /// A file between packet start/end markers
    FilePacketed,
}

impl SendKind {
    /// Whether the body is a file path
    pub fn is_file(self) -> bool {
        matches!(self, SendKind::File | SendKind::FilePacketed)
    }

    /// Whether start/end markers wrap the data frames
    pub fn is_packeted(self) -> bool {
        matches!(self, SendKind::ChunkPacketed | SendKind::FilePacketed)
    }
}

/// What gets sent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SendBody {
    /// In-memory payload
    Bytes(Bytes),
    /// File on disk
    Path(PathBuf),
}

/// A request to send one sequence of frames
#[derive(Clone)]
pub struct SendRequest {
    /// Sequence shape
    pub kind: SendKind,
    /// Major key of every frame in the sequence
    pub major_key: u8,
    /// Minor key of the data frames
    pub minor_key: u8,
    /// Payload or file
    pub body: SendBody,
    /// Text conversion applied before framing
    pub encoding: PayloadEncoding,
    /// Channel that receives progress callbacks
    pub source: Option<Weak<dyn Channel>>,
}

impl SendRequest {
    /// Send `payload` as one sequence
    pub fn chunk(major_key: u8, minor_key: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: SendKind::Chunk,
            major_key,
            minor_key,
            body: SendBody::Bytes(payload.into()),
            encoding: PayloadEncoding::raw(),
            source: None,
        }
    }

    /// Send the contents of `path`
    pub fn file(major_key: u8, minor_key: u8, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SendKind::File,
            major_key,
            minor_key,
            body: SendBody::Path(path.into()),
            encoding: PayloadEncoding::raw(),
            source: None,
        }
    }

    /// Wrap the data frames in packet start/end markers
    pub fn packeted(mut self) -> Self {
        self.kind = match self.kind {
            SendKind::Chunk | SendKind::ChunkPacketed => SendKind::ChunkPacketed,
            SendKind::File | SendKind::FilePacketed => SendKind::FilePacketed,
        };
        self
    }

    /// Convert the payload with `encoding` before framing
    pub fn encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Report progress to `channel`
    pub fn source<C: Channel + 'static>(mut self, channel: &Arc<C>) -> Self {
        let weak: Weak<C> = Arc::downgrade(channel);
        self.source = Some(weak as Weak<dyn Channel>);
        self
    }

    /// Live progress target, if any
    pub(crate) fn source_channel(&self) -> Option<Arc<dyn Channel>> {
        self.source.as_ref().and_then(Weak::upgrade)
    }

    /// Two requests from the same sender with the same content are one request
    pub fn same_as(&self, other: &SendRequest) -> bool {
        let same_source = match (&self.source, &other.source) {
            (None, None) => true,
            (Some(a), Some(b)) => a.ptr_eq(b),
            _ => false,
        };
        same_source
            && self.kind == other.kind
            && self.major_key == other.major_key
            && self.minor_key == other.minor_key
            && self.body == other.body
            && self.encoding == other.encoding
    }
}

impl fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            SendBody::Bytes(b) => format!("{} bytes", b.len()),
            SendBody::Path(p) => p.display().to_string(),
        };
        f.debug_struct("SendRequest")
            .field("kind", &self.kind)
            .field("major_key", &self.major_key)
            .field("minor_key", &self.minor_key)
            .field("body", &body)
            .field("encoding", &self.encoding)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

/// A request plus everyone waiting for its outcome
pub(crate) struct PendingSend {
    pub(crate) request: SendRequest,
    waiters: Vec<oneshot::Sender<SendOutcome>>,
}

impl PendingSend {
    pub(crate) fn new(request: SendRequest, waiter: oneshot::Sender<SendOutcome>) -> Self {
        Self {
            request,
            waiters: vec![waiter],
        }
    }

    pub(crate) fn attach(&mut self, waiter: oneshot::Sender<SendOutcome>) {
        self.waiters.push(waiter);
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Deliver the outcome to every waiter
    pub(crate) fn complete(self, outcome: SendOutcome) {
        for waiter in self.waiters {
            // A dropped ticket just means nobody is listening
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// FIFO of sends waiting for the in-flight one to finish
#[derive(Default)]
pub(crate) struct SendQueue {
    items: VecDeque<PendingSend>,
}

impl SendQueue {
    /// Enqueue, or attach to an identical queued request.
    ///
    /// Returns `true` when the request was merged into an existing entry.
    pub(crate) fn push(&mut self, request: SendRequest, waiter: oneshot::Sender<SendOutcome>) -> bool {
        if let Some(existing) = self.items.iter_mut().find(|p| p.request.same_as(&request)) {
            existing.attach(waiter);
            return true;
        }
        self.items.push_back(PendingSend::new(request, waiter));
        false
    }

    pub(crate) fn pop(&mut self) -> Option<PendingSend> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Resolve everything queued with `outcome`
    pub(crate) fn drain(&mut self, outcome: SendOutcome) -> usize {
        let n = self.items.len();
        for pending in self.items.drain(..) {
            pending.complete(outcome.clone());
        }
        n
    }
}
