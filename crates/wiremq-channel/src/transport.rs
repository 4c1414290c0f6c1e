//! Outbound frame transport seam.

use std::fmt;

use wiremq_protocol::Frame;

use crate::error::TransportError;

/// Outbound half of a connection, as seen by one channel.
///
/// `send_frame` is a non-blocking enqueue: implementations hand the frame to
/// a writer (typically over an in-process queue) and return without waiting
/// for the wire. Frames enqueued by one channel go out in call order; that
/// ordering is what makes kind-based RPC correlation sound.
pub trait FrameTransport: fmt::Debug + Send + Sync {
    /// Enqueues a frame for transmission.
    fn send_frame(&self, frame: Frame) -> Result<(), TransportError>;
}
