//! Error types for the protocol layer.

use thiserror::Error;

/// Errors produced when encoding or decoding frames.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame could not be encoded or decoded.
    #[error("frame serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtocolError>;
