//! Acknowledgement wait
//!
//! Pure state: the engine feeds it the current time and any ACK it sees, and
//! asks [`AckWait::poll`] what to do next.

use std::time::Duration;
use tokio::time::Instant;

/// Result of polling an [`AckWait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// Still waiting
    Pending,
    /// The expected acknowledgement arrived
    Acked,
    /// The deadline passed without an acknowledgement
    TimedOut,
}

/// Wait for an ACK echoing `key`
#[derive(Debug, Clone)]
pub struct AckWait {
    key: u8,
    timeout: Duration,
    deadline: Instant,
    acked: bool,
    retransmissions: u32,
}

impl AckWait {
    /// Start waiting at `now`
    pub fn new(key: u8, timeout: Duration, now: Instant) -> Self {
        Self {
            key,
            timeout,
            deadline: now + timeout,
            acked: false,
            retransmissions: 0,
        }
    }

    /// Major key the acknowledgement must echo
    pub fn key(&self) -> u8 {
        self.key
    }

    /// When the current attempt times out
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Retransmissions made so far
    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// Feed an ACK's minor key; returns whether it was the one awaited
    pub fn observe(&mut self, acked_key: u8) -> bool {
        if acked_key == self.key {
            self.acked = true;
        }
        self.acked
    }

    /// Current status at `now`
    pub fn poll(&self, now: Instant) -> AckStatus {
        if self.acked {
            AckStatus::Acked
        } else if now >= self.deadline {
            AckStatus::TimedOut
        } else {
            AckStatus::Pending
        }
    }

    /// The frame was sent again; restart the clock
    pub fn rearm(&mut self, now: Instant) {
        self.retransmissions += 1;
        self.deadline = now + self.timeout;
    }

    /// Whether another retransmission stays within `max_retries`
    pub fn may_retry(&self, max_retries: Option<u32>) -> bool {
        max_retries.map_or(true, |max| self.retransmissions < max)
    }
}
