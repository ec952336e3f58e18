//! Bridge lifecycle states

use crate::error::{BridgeError, Result};
use serde::Serialize;

/// Lifecycle state of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BridgeState {
    /// Not open (initial, and after close or disconnect)
    Closed,
    /// Open and accepting sends
    Idle,
    /// A reset handshake is running; sends are refused
    Resetting,
    /// Shutting down
    Closing,
}

impl BridgeState {
    /// Whether moving from `self` to `to` is allowed
    pub fn can_transition(self, to: BridgeState) -> bool {
        use BridgeState::*;
        matches!(
            (self, to),
            (Closed, Idle)
                | (Idle, Resetting)
                | (Resetting, Idle)
                | (Idle, Closing)
                | (Resetting, Closing)
                | (Closing, Closed)
                | (Closed, Closed)
                | (Closing, Closing)
        )
    }

    /// Checked transition
    pub fn transition(self, to: BridgeState) -> Result<BridgeState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(BridgeError::InvalidTransition { from: self, to })
        }
    }

    /// Sends are only accepted while idle
    pub fn accepts_sends(self) -> bool {
        self == BridgeState::Idle
    }

    /// A local reset may be requested while idle or already resetting
    pub fn accepts_reset(self) -> bool {
        matches!(self, BridgeState::Idle | BridgeState::Resetting)
    }

    /// Whether the link is open
    pub fn is_open(self) -> bool {
        matches!(self, BridgeState::Idle | BridgeState::Resetting)
    }
}
