#![warn(missing_docs)]

//! wiremq channel engine: RPC correlation, publisher confirms, consumer dispatch, lifecycle

pub mod channel;
pub mod completion;
pub mod config;
pub mod confirms;
pub mod consumer;
pub mod error;
pub mod executor;
pub mod handle;
pub mod metrics;
pub mod rpc;
pub mod status;
pub mod transport;

pub use channel::{Channel, REPLY_SUCCESS};
pub use completion::RpcResult;
pub use config::ChannelConfig;
pub use consumer::DeliveryHandler;
pub use error::{ChannelError, Result, TransportError};
pub use executor::{Executor, TokioExecutor};
pub use handle::RpcHandle;
pub use metrics::MetricsSnapshot;
pub use status::ChannelState;
pub use transport::FrameTransport;
