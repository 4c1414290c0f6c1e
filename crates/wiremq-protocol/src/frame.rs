//! Frame model: a channel-addressed method envelope.

use serde::{Deserialize, Serialize};

use crate::method::Method;

/// A single protocol frame: one method addressed to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Channel the frame belongs to (0 is the connection channel).
    pub channel_id: u16,
    /// The method payload.
    pub method: Method,
}

impl Frame {
    /// Creates a frame addressed to `channel_id`.
    pub fn new(channel_id: u16, method: Method) -> Self {
        Frame { channel_id, method }
    }
}

/// Envelope handed to a consumer callback for each inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Tag of the consumer the message was routed to.
    pub consumer_tag: String,
    /// Broker-assigned delivery tag, scoped to the channel.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Message body.
    pub body: Vec<u8>,
}
