//! Error types for the channel engine.
//!
//! Errors are `Clone` because a single RPC outcome can fan out to several
//! waiters and continuations, each of which receives its own copy.

use thiserror::Error;

/// Errors produced by the frame transport underneath a channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has shut down and accepts no more frames.
    #[error("transport closed")]
    Closed,
    /// An i/o failure reported by the transport.
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// Errors produced by channel operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel is closed; pending and future operations fail with the
    /// close reason.
    #[error("channel closed: {reason}")]
    Closed {
        /// Why the channel closed.
        reason: String,
    },
    /// The broker rejected a published message.
    #[error("broker nacked publish seqno {sequence}")]
    Nack {
        /// Sequence number of the first rejected publish.
        sequence: u64,
    },
    /// A wait ran out of time. The underlying operation keeps its place in
    /// the correlation table; only the wait is abandoned.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that expired, in milliseconds.
        timeout_ms: u64,
    },
    /// The caller broke an API precondition (for example awaiting confirms
    /// on a channel that never entered confirm mode).
    #[error("usage error: {reason}")]
    Usage {
        /// What the caller did wrong.
        reason: String,
    },
    /// The transport refused or failed to carry a frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A completion handle was abandoned without ever being resolved. This
    /// is an engine invariant breach surfaced to the waiter instead of a
    /// silent hang.
    #[error("reply dropped without resolution")]
    ReplyDropped,
}

impl ChannelError {
    /// Shorthand for a [`ChannelError::Closed`] with the given reason.
    pub fn closed(reason: impl Into<String>) -> Self {
        ChannelError::Closed {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ChannelError::Usage`] with the given reason.
    pub fn usage(reason: impl Into<String>) -> Self {
        ChannelError::Usage {
            reason: reason.into(),
        }
    }
}

/// Convenience alias for channel results.
pub type Result<T> = std::result::Result<T, ChannelError>;
