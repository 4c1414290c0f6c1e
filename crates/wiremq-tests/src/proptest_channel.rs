//! Property tests for the correlation table, the confirm window, and the
//! method vocabulary, driven through the public channel surface.

use proptest::prelude::*;
use wiremq_channel::Channel;
use wiremq_protocol::{classify, Frame, Inbound, Method, MethodKind};

use crate::harness::{
    declare, declare_ok, enable_confirms_scripted, exchange_declare, recording_channel, CHANNEL_ID,
};

fn ack_frame(delivery_tag: u64, multiple: bool) -> Frame {
    Frame::new(
        CHANNEL_ID,
        Method::BasicAck {
            delivery_tag,
            multiple,
        },
    )
}

fn nack_frame(delivery_tag: u64, multiple: bool) -> Frame {
    Frame::new(
        CHANNEL_ID,
        Method::BasicNack {
            delivery_tag,
            multiple,
            requeue: false,
        },
    )
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("test runtime")
        .block_on(future)
}

/// A confirm-mode channel with `n` outstanding publishes. Acks and nacks can
/// then be fed synchronously through `handle_frame`.
fn published_channel(n: u64) -> Channel {
    block_on(async {
        let (channel, _transport) = recording_channel();
        enable_confirms_scripted(&channel).await;
        for _ in 0..n {
            channel.publish("", "q", Vec::new()).expect("publish");
        }
        channel
    })
}

fn any_request() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(declare("q")),
        Just(exchange_declare("e", "fanout")),
        Just(Method::QueueBind {
            queue: "q".to_string(),
            exchange: "e".to_string(),
            routing_key: "k".to_string(),
        }),
        Just(Method::ConfirmSelect),
        Just(Method::BasicPublish {
            exchange: "e".to_string(),
            routing_key: "k".to_string(),
            body: vec![1],
        }),
        Just(Method::BasicConsume {
            queue: "q".to_string(),
            consumer_tag: "ctag-1".to_string(),
        }),
        Just(Method::BasicCancel {
            consumer_tag: "ctag-1".to_string(),
        }),
        Just(Method::ChannelClose {
            reply_code: 200,
            reply_text: "bye".to_string(),
        }),
    ]
}

fn any_inbound() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(declare_ok("q")),
        Just(Method::ExchangeDeclareOk),
        Just(Method::QueueBindOk),
        Just(Method::ConfirmSelectOk),
        Just(Method::BasicConsumeOk {
            consumer_tag: "ctag-1".to_string(),
        }),
        Just(Method::BasicCancelOk {
            consumer_tag: "ctag-1".to_string(),
        }),
        (any::<u64>(), any::<bool>()).prop_map(|(delivery_tag, multiple)| Method::BasicAck {
            delivery_tag,
            multiple,
        }),
        (any::<u64>(), any::<bool>(), any::<bool>()).prop_map(
            |(delivery_tag, multiple, requeue)| Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            }
        ),
        Just(Method::BasicDeliver {
            consumer_tag: "ctag-1".to_string(),
            delivery_tag: 3,
            exchange: "e".to_string(),
            routing_key: "k".to_string(),
            body: vec![2],
        }),
        prop_oneof![
            Just(Method::ChannelClose {
                reply_code: 406,
                reply_text: "precondition failed".to_string(),
            }),
            Just(Method::ChannelCloseOk),
        ],
    ]
}

proptest! {
    #[test]
    fn prop_acks_clear_exactly_the_covered_seqnos(
        n in 1..20u64,
        tag in 0..25u64,
        multiple in any::<bool>(),
    ) {
        let channel = published_channel(n);
        channel.handle_frame(ack_frame(tag, multiple));

        let expected = if multiple {
            if tag == 0 { n } else { tag.min(n) }
        } else if (1..=n).contains(&tag) {
            1
        } else {
            0
        };
        prop_assert_eq!(channel.metrics().confirms_acked, expected);
    }

    #[test]
    fn prop_publish_seqnos_count_up_from_one(n in 1..40u64) {
        let seqs = block_on(async {
            let (channel, _transport) = recording_channel();
            enable_confirms_scripted(&channel).await;
            (0..n)
                .map(|_| channel.publish("", "q", Vec::new()).expect("publish"))
                .collect::<Vec<_>>()
        });
        let expected: Vec<u64> = (1..=n).collect();
        prop_assert_eq!(seqs, expected);
    }

    #[test]
    fn prop_every_publish_settles_exactly_once(
        n in 1..15u64,
        ops in proptest::collection::vec((0..20u64, any::<bool>(), any::<bool>()), 0..12),
    ) {
        let channel = published_channel(n);
        for (tag, is_ack, multiple) in ops {
            if is_ack {
                channel.handle_frame(ack_frame(tag, multiple));
            } else {
                channel.handle_frame(nack_frame(tag, multiple));
            }
            let snapshot = channel.metrics();
            prop_assert!(snapshot.confirms_acked + snapshot.confirms_nacked <= n);
        }

        // Sweep whatever is left; the totals must land exactly on n.
        channel.handle_frame(ack_frame(0, true));
        let snapshot = channel.metrics();
        prop_assert_eq!(snapshot.confirms_acked + snapshot.confirms_nacked, n);
    }

    #[test]
    fn prop_replies_resolve_in_per_kind_fifo(
        order in proptest::collection::vec(any::<bool>(), 1..12),
    ) {
        let (channel, _transport) = recording_channel();
        let mut queue_handles = Vec::new();
        let mut exchange_handles = Vec::new();
        for (i, is_queue) in order.iter().enumerate() {
            if *is_queue {
                let handle = channel.async_rpc(declare(&format!("q{i}"))).expect("submit");
                queue_handles.push((i, handle));
            } else {
                let handle = channel
                    .async_rpc(exchange_declare(&format!("e{i}"), "fanout"))
                    .expect("submit");
                exchange_handles.push(handle);
            }
        }

        // Each reply must land on the oldest outstanding request of its
        // kind, regardless of how the kinds were interleaved on submit.
        for (i, handle) in &queue_handles {
            prop_assert!(!handle.is_resolved());
            channel.handle_frame(Frame::new(CHANNEL_ID, declare_ok(&format!("q{i}"))));
            prop_assert_eq!(handle.try_result(), Some(Ok(declare_ok(&format!("q{i}")))));
        }
        for handle in &exchange_handles {
            prop_assert!(!handle.is_resolved());
            channel.handle_frame(Frame::new(CHANNEL_ID, Method::ExchangeDeclareOk));
            prop_assert!(handle.is_resolved());
        }
    }

    #[test]
    fn prop_request_reply_kinds_pair_consistently(method in any_request()) {
        let kind = method.kind();
        match kind.expected_reply() {
            Some(reply) => {
                // close-ok answers channel.close but runs through the
                // lifecycle path, not the correlation table.
                if kind != MethodKind::ChannelClose {
                    prop_assert!(reply.is_reply());
                }
                prop_assert!(!kind.is_reply());
            }
            None => prop_assert_eq!(kind, MethodKind::BasicPublish),
        }
    }

    #[test]
    fn prop_inbound_classification_routes_each_method(method in any_inbound()) {
        let kind = method.kind();
        match classify(method) {
            Inbound::Reply(m) => {
                prop_assert!(m.kind().is_reply());
                prop_assert_eq!(m.kind(), kind);
            }
            Inbound::Ack { .. } => prop_assert_eq!(kind, MethodKind::BasicAck),
            Inbound::Nack { .. } => prop_assert_eq!(kind, MethodKind::BasicNack),
            Inbound::Delivery(d) => {
                prop_assert_eq!(kind, MethodKind::BasicDeliver);
                prop_assert_eq!(d.consumer_tag.as_str(), "ctag-1");
            }
            Inbound::Close { .. } => prop_assert_eq!(kind, MethodKind::ChannelClose),
            Inbound::CloseOk => prop_assert_eq!(kind, MethodKind::ChannelCloseOk),
            Inbound::Unexpected(m) => prop_assert!(false, "inbound {:?} must classify", m.kind()),
        }
    }

    #[test]
    fn prop_outbound_requests_classify_as_unexpected_inbound(method in any_request()) {
        prop_assume!(method.kind() != MethodKind::ChannelClose);
        prop_assert!(matches!(classify(method), Inbound::Unexpected(_)));
    }
}
