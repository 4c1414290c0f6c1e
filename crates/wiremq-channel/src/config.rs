//! Channel configuration.

use std::time::Duration;

/// Default timeout for a single RPC round trip.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for the peer's close-ok before forcing the channel
/// closed.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on simultaneously outstanding RPCs per channel.
pub const DEFAULT_MAX_IN_FLIGHT_RPCS: usize = 8192;

/// Default prefix for generated consumer tags.
pub const DEFAULT_CONSUMER_TAG_PREFIX: &str = "ctag";

/// Tunables for a single channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long [`Channel::rpc`](crate::Channel::rpc) waits for a reply
    /// before giving up with a timeout error. The request itself keeps
    /// its correlation slot; only the wait is abandoned.
    pub rpc_timeout: Duration,
    /// How long a local close waits for the peer's close-ok before the
    /// channel is forced closed anyway.
    pub close_timeout: Duration,
    /// Maximum number of RPCs allowed in flight at once. Registering one
    /// more fails with a usage error.
    pub max_in_flight_rpcs: usize,
    /// Prefix used when generating consumer tags ("{prefix}-{n}").
    pub consumer_tag_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_in_flight_rpcs: DEFAULT_MAX_IN_FLIGHT_RPCS,
            consumer_tag_prefix: DEFAULT_CONSUMER_TAG_PREFIX.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert_eq!(config.max_in_flight_rpcs, 8192);
        assert_eq!(config.consumer_tag_prefix, "ctag");
    }
}
