//! Publisher-confirm suites: window drain, nacks, batched acks, misuse.

use std::sync::Arc;
use std::time::Duration;

use wiremq_channel::{Channel, ChannelError, ChannelState};
use wiremq_protocol::{Frame, Method};

use crate::harness::{
    broker_rig, broker_rig_with, declare, enable_confirms_scripted, recording_channel,
    BrokerConfig, RecordingTransport, CHANNEL_ID,
};

async fn confirm_channel() -> (Channel, Arc<RecordingTransport>) {
    let (channel, transport) = recording_channel();
    enable_confirms_scripted(&channel).await;
    (channel, transport)
}

fn ack(delivery_tag: u64, multiple: bool) -> Frame {
    Frame::new(
        CHANNEL_ID,
        Method::BasicAck {
            delivery_tag,
            multiple,
        },
    )
}

fn nack(delivery_tag: u64) -> Frame {
    Frame::new(
        CHANNEL_ID,
        Method::BasicNack {
            delivery_tag,
            multiple: false,
            requeue: false,
        },
    )
}

mod window_tests {
    use super::*;

    #[tokio::test]
    async fn test_await_with_empty_window_returns_immediately() {
        let (channel, _transport) = confirm_channel().await;
        channel
            .await_confirms(Duration::from_millis(50))
            .await
            .unwrap();

        // Still clean after a publish/ack cycle.
        channel.publish("", "q", b"x".to_vec()).unwrap();
        channel.handle_frame(ack(1, false));
        channel
            .await_confirms(Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_seqnos_start_at_one_and_count_up() {
        let (channel, _transport) = confirm_channel().await;
        assert_eq!(channel.publish("", "q", b"a".to_vec()).unwrap(), 1);
        assert_eq!(channel.publish("", "q", b"b".to_vec()).unwrap(), 2);
        assert_eq!(channel.publish("", "q", b"c".to_vec()).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_multiple_ack_covers_prefix_only() {
        let (channel, _transport) = confirm_channel().await;
        for _ in 0..3 {
            channel.publish("", "q", Vec::new()).unwrap();
        }
        channel.handle_frame(ack(2, true));
        let err = channel
            .await_confirms(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));

        // The timeout left the window intact; settling 3 completes a retry.
        channel.handle_frame(ack(3, false));
        channel
            .await_confirms(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(channel.metrics().confirms_acked, 3);
        assert_eq!(channel.metrics().confirm_timeouts, 1);
    }

    #[tokio::test]
    async fn test_multiple_ack_with_tag_zero_clears_all() {
        let (channel, _transport) = confirm_channel().await;
        for _ in 0..3 {
            channel.publish("", "q", Vec::new()).unwrap();
        }
        channel.handle_frame(ack(0, true));
        channel
            .await_confirms(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(channel.metrics().confirms_acked, 3);
    }

    #[tokio::test]
    async fn test_nack_is_reported_even_after_later_acks() {
        let (channel, _transport) = confirm_channel().await;
        for _ in 0..3 {
            channel.publish("", "q", Vec::new()).unwrap();
        }
        channel.handle_frame(nack(2));
        channel.handle_frame(ack(1, false));
        channel.handle_frame(ack(3, false));

        let err = channel
            .await_confirms(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Nack { sequence: 2 });

        // The rejection stays on the ledger for later waits too.
        let err = channel
            .await_confirms(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Nack { sequence: 2 });
    }

    #[tokio::test]
    async fn test_publish_then_enable_is_a_usage_error() {
        let (channel, transport) = recording_channel();
        assert_eq!(channel.publish("", "q", b"x".to_vec()).unwrap(), 0);

        let err = channel.enable_confirms().await.unwrap_err();
        assert!(matches!(err, ChannelError::Usage { .. }));
        // Refused before spending the round trip.
        assert!(!transport.sent_methods().contains(&Method::ConfirmSelect));
    }

    #[tokio::test]
    async fn test_await_without_confirm_mode_is_a_usage_error() {
        let (channel, _transport) = recording_channel();
        let err = channel
            .await_confirms(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Usage { .. }));
    }
}

mod broker_confirm_tests {
    use super::*;

    #[tokio::test]
    async fn test_every_publish_acked_individually() -> anyhow::Result<()> {
        let rig = broker_rig();
        let channel = rig.channel.clone();
        channel.rpc(declare("q")).await?;
        channel.enable_confirms().await?;

        for i in 0..5u32 {
            channel.publish("", "q", format!("m{i}").into_bytes())?;
        }
        channel.await_confirms(Duration::from_secs(1)).await?;
        assert_eq!(channel.metrics().confirms_acked, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_batched_multiple_acks_cover_the_window() -> anyhow::Result<()> {
        let rig = broker_rig_with(BrokerConfig {
            ack_every: 3,
            ..BrokerConfig::default()
        });
        let channel = rig.channel.clone();
        channel.rpc(declare("q")).await?;
        channel.enable_confirms().await?;

        for _ in 0..6 {
            channel.publish("", "q", b"m".to_vec())?;
        }
        channel.await_confirms(Duration::from_secs(1)).await?;
        assert_eq!(channel.metrics().confirms_acked, 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_nacked_publish_fails_the_wait_and_or_die_closes() -> anyhow::Result<()> {
        let rig = broker_rig_with(BrokerConfig {
            nack_body: Some(b"poison".to_vec()),
            ..BrokerConfig::default()
        });
        let channel = rig.channel.clone();
        channel.rpc(declare("q")).await?;
        channel.enable_confirms().await?;

        channel.publish("", "q", b"fine".to_vec())?;
        channel.publish("", "q", b"poison".to_vec())?;

        let err = channel
            .await_confirms(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Nack { sequence: 2 });

        let err = channel
            .wait_for_confirms_or_die(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Nack { sequence: 2 });
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.metrics().confirms_nacked, 1);
        Ok(())
    }
}
