#![warn(missing_docs)]

//! wiremq protocol layer: method vocabulary, frame model, and inbound-frame classification.

pub mod codec;
pub mod error;
pub mod frame;
pub mod method;

pub use codec::{deserialize_frame, serialize_frame};
pub use error::{ProtocolError, Result};
pub use frame::{Delivery, Frame};
pub use method::{classify, Inbound, Method, MethodKind};
