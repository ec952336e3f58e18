//! Channels: the application-side endpoints frames are dispatched to

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// An application endpoint bound to a major key.
///
/// Callbacks run on the engine task and must not block.
pub trait Channel: Send + Sync {
    /// Major key this channel owns
    fn major_key(&self) -> u8;

    /// Receive every dispatched frame regardless of its key
    fn accepts_all(&self) -> bool {
        false
    }

    /// A verified data frame arrived
    fn receive(&self, minor_key: u8, payload: Bytes);

    /// Progress of a send this channel started
    fn on_send_progress(&self, _percent: u8, _label: &str) {}

    /// Progress of a packeted transfer arriving on this channel's key
    fn on_receive_progress(&self, _percent: u8, _label: &str) {}

    /// The transport went away
    fn on_disconnect(&self) {}
}

/// Weakly held channels, indexed by major key
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    by_key: BTreeMap<u8, Weak<dyn Channel>>,
    accept_all: Vec<Weak<dyn Channel>>,
}

impl ChannelRegistry {
    pub(crate) fn register(&mut self, channel: Weak<dyn Channel>) {
        let Some(strong) = channel.upgrade() else {
            return;
        };
        if strong.accepts_all() {
            self.accept_all.retain(|c| c.strong_count() > 0 && !c.ptr_eq(&channel));
            self.accept_all.push(channel.clone());
        }
        self.by_key.insert(strong.major_key(), channel);
    }

    pub(crate) fn deregister(&mut self, major_key: u8) {
        if let Some(removed) = self.by_key.remove(&major_key) {
            self.accept_all.retain(|c| !c.ptr_eq(&removed));
        }
    }

    /// Live channel registered for exactly `major_key`
    pub(crate) fn exact(&self, major_key: u8) -> Option<Arc<dyn Channel>> {
        self.by_key.get(&major_key).and_then(Weak::upgrade)
    }

    /// Channels a frame with `major_key` is dispatched to
    pub(crate) fn targets(&mut self, major_key: u8) -> Vec<Arc<dyn Channel>> {
        self.prune();
        let mut out: Vec<Arc<dyn Channel>> = Vec::new();
        if let Some(ch) = self.exact(major_key) {
            out.push(ch);
        }
        for weak in &self.accept_all {
            if let Some(ch) = weak.upgrade() {
                if !out.iter().any(|o| Arc::ptr_eq(o, &ch)) {
                    out.push(ch);
                }
            }
        }
        out
    }

    /// Every live channel, once each
    pub(crate) fn all(&mut self) -> Vec<Arc<dyn Channel>> {
        self.prune();
        let mut out: Vec<Arc<dyn Channel>> = Vec::new();
        for ch in self
            .by_key
            .values()
            .chain(self.accept_all.iter())
            .filter_map(Weak::upgrade)
        {
            if !out.iter().any(|o| Arc::ptr_eq(o, &ch)) {
                out.push(ch);
            }
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    fn prune(&mut self) {
        self.by_key.retain(|_, c| c.strong_count() > 0);
        self.accept_all.retain(|c| c.strong_count() > 0);
    }
}
