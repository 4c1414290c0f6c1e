//! Protocol method vocabulary and inbound-frame classification.
//!
//! Methods come in request/reply pairs (queue.declare / queue.declare-ok and
//! friends). The broker answers requests of one pair in the order they were
//! sent on a channel, so a reply is correlated by its [`MethodKind`] alone:
//! the oldest outstanding request expecting that kind owns the reply.

use serde::{Deserialize, Serialize};

use crate::frame::Delivery;

/// A protocol method carried by a frame.
///
/// Message bodies ride inside the method that owns them (`BasicPublish`,
/// `BasicDeliver`); splitting them into separate content frames is the wire
/// codec's concern, below this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// Declare a queue.
    QueueDeclare {
        /// Queue name.
        queue: String,
        /// Survive broker restart.
        durable: bool,
        /// Restrict to this connection.
        exclusive: bool,
        /// Delete when the last consumer leaves.
        auto_delete: bool,
    },
    /// Reply to `QueueDeclare`.
    QueueDeclareOk {
        /// Queue name as settled by the broker.
        queue: String,
        /// Messages currently in the queue.
        message_count: u32,
        /// Consumers currently attached.
        consumer_count: u32,
    },
    /// Declare an exchange.
    ExchangeDeclare {
        /// Exchange name.
        exchange: String,
        /// Exchange type ("fanout", "direct", ...).
        kind: String,
        /// Survive broker restart.
        durable: bool,
        /// Delete when the last binding is removed.
        auto_delete: bool,
    },
    /// Reply to `ExchangeDeclare`.
    ExchangeDeclareOk,
    /// Bind a queue to an exchange.
    QueueBind {
        /// Queue name.
        queue: String,
        /// Exchange name.
        exchange: String,
        /// Routing key.
        routing_key: String,
    },
    /// Reply to `QueueBind`.
    QueueBindOk,
    /// Switch the channel into publisher-confirm mode.
    ConfirmSelect,
    /// Reply to `ConfirmSelect`.
    ConfirmSelectOk,
    /// Publish a message.
    BasicPublish {
        /// Target exchange ("" for the default exchange).
        exchange: String,
        /// Routing key.
        routing_key: String,
        /// Message body.
        body: Vec<u8>,
    },
    /// Broker acknowledges published message(s).
    BasicAck {
        /// Sequence number being acknowledged.
        delivery_tag: u64,
        /// Acknowledge every outstanding number up to and including the tag.
        multiple: bool,
    },
    /// Broker rejects published message(s).
    BasicNack {
        /// Sequence number being rejected.
        delivery_tag: u64,
        /// Reject every outstanding number up to and including the tag.
        multiple: bool,
        /// Broker will requeue the message(s).
        requeue: bool,
    },
    /// Start a consumer on a queue.
    BasicConsume {
        /// Queue name.
        queue: String,
        /// Consumer tag identifying the subscription.
        consumer_tag: String,
    },
    /// Reply to `BasicConsume`.
    BasicConsumeOk {
        /// Tag the broker settled on.
        consumer_tag: String,
    },
    /// Stop a consumer.
    BasicCancel {
        /// Tag of the consumer to stop.
        consumer_tag: String,
    },
    /// Reply to `BasicCancel`.
    BasicCancelOk {
        /// Tag of the stopped consumer.
        consumer_tag: String,
    },
    /// Inbound message for a consumer.
    BasicDeliver {
        /// Tag of the consumer the message is for.
        consumer_tag: String,
        /// Broker-assigned delivery tag.
        delivery_tag: u64,
        /// Exchange the message was published to.
        exchange: String,
        /// Routing key it was published with.
        routing_key: String,
        /// Message body.
        body: Vec<u8>,
    },
    /// Close the channel (sent by either peer).
    ChannelClose {
        /// Close reason code (200 = normal).
        reply_code: u16,
        /// Human-readable close reason.
        reply_text: String,
    },
    /// Reply to `ChannelClose`.
    ChannelCloseOk,
}

impl Method {
    /// Returns the kind discriminant of this method.
    pub fn kind(&self) -> MethodKind {
        match self {
            Method::QueueDeclare { .. } => MethodKind::QueueDeclare,
            Method::QueueDeclareOk { .. } => MethodKind::QueueDeclareOk,
            Method::ExchangeDeclare { .. } => MethodKind::ExchangeDeclare,
            Method::ExchangeDeclareOk => MethodKind::ExchangeDeclareOk,
            Method::QueueBind { .. } => MethodKind::QueueBind,
            Method::QueueBindOk => MethodKind::QueueBindOk,
            Method::ConfirmSelect => MethodKind::ConfirmSelect,
            Method::ConfirmSelectOk => MethodKind::ConfirmSelectOk,
            Method::BasicPublish { .. } => MethodKind::BasicPublish,
            Method::BasicAck { .. } => MethodKind::BasicAck,
            Method::BasicNack { .. } => MethodKind::BasicNack,
            Method::BasicConsume { .. } => MethodKind::BasicConsume,
            Method::BasicConsumeOk { .. } => MethodKind::BasicConsumeOk,
            Method::BasicCancel { .. } => MethodKind::BasicCancel,
            Method::BasicCancelOk { .. } => MethodKind::BasicCancelOk,
            Method::BasicDeliver { .. } => MethodKind::BasicDeliver,
            Method::ChannelClose { .. } => MethodKind::ChannelClose,
            Method::ChannelCloseOk => MethodKind::ChannelCloseOk,
        }
    }
}

/// Method discriminant, used as the correlation key for request/reply pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    /// queue.declare
    QueueDeclare,
    /// queue.declare-ok
    QueueDeclareOk,
    /// exchange.declare
    ExchangeDeclare,
    /// exchange.declare-ok
    ExchangeDeclareOk,
    /// queue.bind
    QueueBind,
    /// queue.bind-ok
    QueueBindOk,
    /// confirm.select
    ConfirmSelect,
    /// confirm.select-ok
    ConfirmSelectOk,
    /// basic.publish
    BasicPublish,
    /// basic.ack
    BasicAck,
    /// basic.nack
    BasicNack,
    /// basic.consume
    BasicConsume,
    /// basic.consume-ok
    BasicConsumeOk,
    /// basic.cancel
    BasicCancel,
    /// basic.cancel-ok
    BasicCancelOk,
    /// basic.deliver
    BasicDeliver,
    /// channel.close
    ChannelClose,
    /// channel.close-ok
    ChannelCloseOk,
}

impl MethodKind {
    /// Returns the reply kind a request of this kind waits for, or `None`
    /// for methods that expect no reply (publishes, acks, deliveries).
    pub fn expected_reply(self) -> Option<MethodKind> {
        match self {
            MethodKind::QueueDeclare => Some(MethodKind::QueueDeclareOk),
            MethodKind::ExchangeDeclare => Some(MethodKind::ExchangeDeclareOk),
            MethodKind::QueueBind => Some(MethodKind::QueueBindOk),
            MethodKind::ConfirmSelect => Some(MethodKind::ConfirmSelectOk),
            MethodKind::BasicConsume => Some(MethodKind::BasicConsumeOk),
            MethodKind::BasicCancel => Some(MethodKind::BasicCancelOk),
            MethodKind::ChannelClose => Some(MethodKind::ChannelCloseOk),
            _ => None,
        }
    }

    /// True for kinds that answer a request (the `*Ok` family, close-ok
    /// excluded: channel close has its own lifecycle handling).
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MethodKind::QueueDeclareOk
                | MethodKind::ExchangeDeclareOk
                | MethodKind::QueueBindOk
                | MethodKind::ConfirmSelectOk
                | MethodKind::BasicConsumeOk
                | MethodKind::BasicCancelOk
        )
    }
}

/// Classification of an inbound frame, as seen by the channel's reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Reply to an outstanding request; resolved against the correlation table.
    Reply(Method),
    /// Positive publisher confirm.
    Ack {
        /// Sequence number being acknowledged.
        delivery_tag: u64,
        /// Covers every outstanding number up to and including the tag.
        multiple: bool,
    },
    /// Negative publisher confirm.
    Nack {
        /// Sequence number being rejected.
        delivery_tag: u64,
        /// Covers every outstanding number up to and including the tag.
        multiple: bool,
        /// Broker will requeue the message(s).
        requeue: bool,
    },
    /// Message delivery for a registered consumer.
    Delivery(Delivery),
    /// Peer is closing the channel.
    Close {
        /// Close reason code.
        reply_code: u16,
        /// Human-readable close reason.
        reply_text: String,
    },
    /// Peer confirms our close request.
    CloseOk,
    /// A method the broker should never send to a client (protocol breach);
    /// the receiver logs and drops it.
    Unexpected(Method),
}

/// Classifies an inbound method for the reader's routing switch.
pub fn classify(method: Method) -> Inbound {
    match method {
        Method::BasicAck {
            delivery_tag,
            multiple,
        } => Inbound::Ack {
            delivery_tag,
            multiple,
        },
        Method::BasicNack {
            delivery_tag,
            multiple,
            requeue,
        } => Inbound::Nack {
            delivery_tag,
            multiple,
            requeue,
        },
        Method::BasicDeliver {
            consumer_tag,
            delivery_tag,
            exchange,
            routing_key,
            body,
        } => Inbound::Delivery(Delivery {
            consumer_tag,
            delivery_tag,
            exchange,
            routing_key,
            body,
        }),
        Method::ChannelClose {
            reply_code,
            reply_text,
        } => Inbound::Close {
            reply_code,
            reply_text,
        },
        Method::ChannelCloseOk => Inbound::CloseOk,
        m if m.kind().is_reply() => Inbound::Reply(m),
        m => Inbound::Unexpected(m),
    }
}
