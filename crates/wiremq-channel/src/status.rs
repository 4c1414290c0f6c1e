//! Channel lifecycle state machine.
//!
//! A channel moves strictly forward: `Open` -> `Closing` -> `Closed`. The
//! transition out of `Open` is claimed with a compare-exchange so exactly
//! one closer (local call, remote close frame, or transport failure) wins
//! and records the close reason; everyone else observes the state.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Accepting operations.
    Open = 0,
    /// Close handshake in progress; new operations are refused.
    Closing = 1,
    /// Terminal. All operations fail with the recorded close reason.
    Closed = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Open,
            1 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Shared lifecycle handle. Cheap to read on every operation.
#[derive(Debug)]
pub struct ChannelStatus {
    state: AtomicU8,
    reason: Mutex<Option<String>>,
}

impl ChannelStatus {
    /// Creates a status in the `Open` state.
    pub fn new() -> Self {
        ChannelStatus {
            state: AtomicU8::new(ChannelState::Open as u8),
            reason: Mutex::new(None),
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while the channel accepts new operations.
    pub fn is_open(&self) -> bool {
        self.current() == ChannelState::Open
    }

    /// Claims the `Open` -> `Closing` transition. Returns true if this
    /// caller won the claim; the winner's reason is the one recorded.
    pub fn begin_close(&self, reason: &str) -> bool {
        let won = self
            .state
            .compare_exchange(
                ChannelState::Open as u8,
                ChannelState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.record_reason(reason);
        }
        won
    }

    /// Completes the handshake: `Closing` -> `Closed`.
    pub fn finish_close(&self) {
        self.state
            .store(ChannelState::Closed as u8, Ordering::Release);
    }

    /// Jumps straight to `Closed` from any state, recording `reason` if no
    /// earlier closer recorded one. Used when the transport dies under us.
    pub fn force_closed(&self, reason: &str) {
        self.record_reason(reason);
        self.state
            .store(ChannelState::Closed as u8, Ordering::Release);
    }

    /// The reason recorded by whichever closer won, if any yet.
    pub fn close_reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    /// The recorded close reason, or `fallback` if none was recorded.
    pub fn reason_or(&self, fallback: &str) -> String {
        self.close_reason().unwrap_or_else(|| fallback.to_string())
    }

    fn record_reason(&self, reason: &str) {
        let mut slot = self.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self::new()
    }
}
