//! wiremq test infrastructure
//!
//! A scripted in-process broker wired behind the `FrameTransport` seam, plus
//! integration suites for channel scenarios and property tests for the
//! confirm window and the correlation table.

pub mod harness;

pub use harness::{
    bind, broker_rig, broker_rig_with, declare, declare_ok, declared_queue,
    enable_confirms_scripted, exchange_declare, init_logging, recording_channel, BrokerConfig,
    BrokerRig, RecordingTransport, CHANNEL_ID,
};

#[cfg(test)]
mod confirm_tests;
#[cfg(test)]
mod proptest_channel;
