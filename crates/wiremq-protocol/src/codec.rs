//! Frame serialization.
//!
//! Frames are bincode-encoded. The transport below this layer adds length
//! prefixes or whatever else its medium needs; this module only maps a
//! [`Frame`] to bytes and back.

use crate::error::{ProtocolError, Result};
use crate::frame::Frame;

/// Serializes a frame to bytes.
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>> {
    bincode::serialize(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Deserializes a frame from bytes.
pub fn deserialize_frame(data: &[u8]) -> Result<Frame> {
    bincode::deserialize(data).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(
            3,
            Method::BasicPublish {
                exchange: "logs".into(),
                routing_key: "".into(),
                body: b"hello".to_vec(),
            },
        );
        let bytes = serialize_frame(&frame).unwrap();
        let back = deserialize_frame(&bytes).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        let result = deserialize_frame(&[0xff; 3]);
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }
}
