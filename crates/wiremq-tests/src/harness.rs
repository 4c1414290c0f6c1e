//! Scripted in-process broker and transports for driving a channel in tests.
//!
//! [`broker_rig`] wires a [`Channel`] to a `MiniBroker` task over the frame
//! codec: outbound frames are serialized into one pipe, broker replies come
//! back through another and are fed to [`Channel::handle_frame`] by a reader
//! task, the same shape a socket-backed connection has.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wiremq_channel::{Channel, ChannelConfig, FrameTransport, TransportError};
use wiremq_protocol::{deserialize_frame, serialize_frame, Frame, Method};

/// Channel id used by every rig in this crate.
pub const CHANNEL_ID: u16 = 1;

/// Installs a fmt subscriber honoring `RUST_LOG`; safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// Short timeouts so stuck tests fail fast instead of hanging the suite.
fn test_channel_config() -> ChannelConfig {
    ChannelConfig {
        rpc_timeout: Duration::from_secs(2),
        close_timeout: Duration::from_secs(1),
        ..ChannelConfig::default()
    }
}

/// Transport that records outbound frames and never produces replies.
///
/// Tests drive the inbound side by hand through [`Channel::handle_frame`],
/// which makes reply order and interleaving fully scriptable.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Frame>>,
}

impl RecordingTransport {
    /// Creates a recording transport behind an `Arc`, ready for [`Channel::new`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Methods sent so far, in wire order.
    pub fn sent_methods(&self) -> Vec<Method> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.method.clone())
            .collect()
    }

    /// Number of frames sent so far.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl FrameTransport for RecordingTransport {
    fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }
}

/// A channel over a [`RecordingTransport`], for tests that script both sides.
pub fn recording_channel() -> (Channel, Arc<RecordingTransport>) {
    init_logging();
    let transport = RecordingTransport::new();
    let channel = Channel::new(CHANNEL_ID, transport.clone(), test_channel_config());
    (channel, transport)
}

/// Knobs for the scripted broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Confirm publishes in batches of this size; batches larger than one are
    /// acknowledged with a single multiple-ack covering the whole batch.
    pub ack_every: u64,
    /// Publishes carrying exactly this body are nacked instead of acked.
    pub nack_body: Option<Vec<u8>>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            ack_every: 1,
            nack_body: None,
        }
    }
}

/// Frame transport feeding the broker task's inbound pipe.
#[derive(Debug)]
struct BrokerTransport {
    to_broker: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameTransport for BrokerTransport {
    fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let bytes = serialize_frame(&frame).map_err(|e| TransportError::Io(e.to_string()))?;
        self.to_broker.send(bytes).map_err(|_| TransportError::Closed)
    }
}

#[derive(Default)]
struct QueueState {
    consumers: Vec<String>,
    // (exchange, routing key, body) held until a consumer arrives.
    buffered: Vec<(String, String, Vec<u8>)>,
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

/// Minimal broker: queues with buffering, fanout and direct exchanges,
/// publisher confirms. Answers every request in arrival order, which is the
/// ordering contract the correlation table is built on.
struct MiniBroker {
    config: BrokerConfig,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    exchanges: HashMap<String, String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    confirm_mode: bool,
    publish_seq: u64,
    delivery_tag: u64,
    batch: u64,
}

impl MiniBroker {
    fn new(config: BrokerConfig, to_client: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        MiniBroker {
            config,
            to_client,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            confirm_mode: false,
            publish_seq: 0,
            delivery_tag: 0,
            batch: 0,
        }
    }

    async fn run(mut self, mut from_client: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(bytes) = from_client.recv().await {
            match deserialize_frame(&bytes) {
                Ok(frame) => self.on_method(frame.channel_id, frame.method),
                Err(error) => warn!(error = %error, "broker dropped undecodable frame"),
            }
        }
    }

    fn on_method(&mut self, channel_id: u16, method: Method) {
        match method {
            Method::QueueDeclare { queue, .. } => {
                let state = self.queues.entry(queue.clone()).or_default();
                let message_count = state.buffered.len() as u32;
                let consumer_count = state.consumers.len() as u32;
                self.send(
                    channel_id,
                    Method::QueueDeclareOk {
                        queue,
                        message_count,
                        consumer_count,
                    },
                );
            }
            Method::ExchangeDeclare { exchange, kind, .. } => {
                self.exchanges.insert(exchange, kind);
                self.send(channel_id, Method::ExchangeDeclareOk);
            }
            Method::QueueBind {
                queue,
                exchange,
                routing_key,
            } => {
                self.bindings.push(Binding {
                    exchange,
                    queue,
                    routing_key,
                });
                self.send(channel_id, Method::QueueBindOk);
            }
            Method::ConfirmSelect => {
                self.confirm_mode = true;
                self.send(channel_id, Method::ConfirmSelectOk);
            }
            Method::BasicPublish {
                exchange,
                routing_key,
                body,
            } => {
                for queue in self.route(&exchange, &routing_key) {
                    self.deliver_or_buffer(channel_id, &queue, &exchange, &routing_key, body.clone());
                }
                if self.confirm_mode {
                    self.confirm(channel_id, &body);
                }
            }
            Method::BasicConsume {
                queue,
                consumer_tag,
            } => {
                let buffered = match self.queues.get_mut(&queue) {
                    Some(state) => {
                        state.consumers.push(consumer_tag.clone());
                        std::mem::take(&mut state.buffered)
                    }
                    None => Vec::new(),
                };
                self.send(
                    channel_id,
                    Method::BasicConsumeOk {
                        consumer_tag: consumer_tag.clone(),
                    },
                );
                for (exchange, routing_key, body) in buffered {
                    self.delivery_tag += 1;
                    self.send(
                        channel_id,
                        Method::BasicDeliver {
                            consumer_tag: consumer_tag.clone(),
                            delivery_tag: self.delivery_tag,
                            exchange,
                            routing_key,
                            body,
                        },
                    );
                }
            }
            Method::BasicCancel { consumer_tag } => {
                for state in self.queues.values_mut() {
                    state.consumers.retain(|t| t != &consumer_tag);
                }
                self.send(channel_id, Method::BasicCancelOk { consumer_tag });
            }
            Method::ChannelClose { .. } => {
                self.send(channel_id, Method::ChannelCloseOk);
            }
            Method::ChannelCloseOk => {}
            other => warn!(method = ?other.kind(), "broker ignoring unexpected method"),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            // Default exchange: the routing key names the target queue.
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }
        let Some(kind) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        self.bindings
            .iter()
            .filter(|b| {
                b.exchange == exchange && (kind.as_str() == "fanout" || b.routing_key == routing_key)
            })
            .map(|b| b.queue.clone())
            .collect()
    }

    fn deliver_or_buffer(
        &mut self,
        channel_id: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) {
        let consumer = match self.queues.get_mut(queue) {
            Some(state) => match state.consumers.first().cloned() {
                Some(tag) => tag,
                None => {
                    state
                        .buffered
                        .push((exchange.to_string(), routing_key.to_string(), body));
                    return;
                }
            },
            None => return,
        };
        self.delivery_tag += 1;
        self.send(
            channel_id,
            Method::BasicDeliver {
                consumer_tag: consumer,
                delivery_tag: self.delivery_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body,
            },
        );
    }

    fn confirm(&mut self, channel_id: u16, body: &[u8]) {
        self.publish_seq += 1;
        let seq = self.publish_seq;
        if self.config.nack_body.as_deref() == Some(body) {
            self.send(
                channel_id,
                Method::BasicNack {
                    delivery_tag: seq,
                    multiple: false,
                    requeue: false,
                },
            );
            return;
        }
        self.batch += 1;
        if self.batch >= self.config.ack_every {
            self.send(
                channel_id,
                Method::BasicAck {
                    delivery_tag: seq,
                    multiple: self.config.ack_every > 1,
                },
            );
            self.batch = 0;
        }
    }

    fn send(&self, channel_id: u16, method: Method) {
        match serialize_frame(&Frame::new(channel_id, method)) {
            Ok(bytes) => {
                let _ = self.to_client.send(bytes);
            }
            Err(error) => warn!(error = %error, "broker failed to encode reply"),
        }
    }
}

/// A channel wired to a scripted in-process broker.
///
/// Broker and reader tasks run on the ambient runtime and are torn down with
/// it when the test ends.
#[derive(Debug, Clone)]
pub struct BrokerRig {
    /// The channel under test.
    pub channel: Channel,
}

/// Spawns a scripted broker with default knobs and wires a channel to it.
///
/// Call from inside a tokio runtime.
pub fn broker_rig() -> BrokerRig {
    broker_rig_with(BrokerConfig::default())
}

/// Spawns a scripted broker with the given knobs and wires a channel to it.
pub fn broker_rig_with(config: BrokerConfig) -> BrokerRig {
    init_logging();
    let (to_broker_tx, to_broker_rx) = mpsc::unbounded_channel();
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel();

    let transport = Arc::new(BrokerTransport {
        to_broker: to_broker_tx,
    });
    let channel = Channel::new(CHANNEL_ID, transport, test_channel_config());

    tokio::spawn(MiniBroker::new(config, to_client_tx).run(to_broker_rx));

    let reader = channel.clone();
    tokio::spawn(async move {
        while let Some(bytes) = to_client_rx.recv().await {
            match deserialize_frame(&bytes) {
                Ok(frame) => reader.handle_frame(frame),
                Err(error) => warn!(error = %error, "reader dropped undecodable frame"),
            }
        }
    });

    BrokerRig { channel }
}

/// Pulls the settled queue name out of a queue.declare-ok reply.
pub fn declared_queue(reply: Method) -> anyhow::Result<String> {
    match reply {
        Method::QueueDeclareOk { queue, .. } => Ok(queue),
        other => anyhow::bail!("expected queue.declare-ok, got {:?}", other),
    }
}

/// queue.declare with transient defaults.
pub fn declare(queue: &str) -> Method {
    Method::QueueDeclare {
        queue: queue.to_string(),
        durable: false,
        exclusive: false,
        auto_delete: true,
    }
}

/// The matching queue.declare-ok with zero counts.
pub fn declare_ok(queue: &str) -> Method {
    Method::QueueDeclareOk {
        queue: queue.to_string(),
        message_count: 0,
        consumer_count: 0,
    }
}

/// exchange.declare with transient defaults.
pub fn exchange_declare(name: &str, kind: &str) -> Method {
    Method::ExchangeDeclare {
        exchange: name.to_string(),
        kind: kind.to_string(),
        durable: false,
        auto_delete: false,
    }
}

/// queue.bind.
pub fn bind(queue: &str, exchange: &str, routing_key: &str) -> Method {
    Method::QueueBind {
        queue: queue.to_string(),
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
    }
}

/// Drives the confirm.select handshake to completion on a scripted channel,
/// answering the select-ok itself so no broker is needed.
pub async fn enable_confirms_scripted(channel: &Channel) {
    let feeder = async {
        tokio::task::yield_now().await;
        channel.handle_frame(Frame::new(CHANNEL_ID, Method::ConfirmSelectOk));
    };
    let (enabled, ()) = tokio::join!(channel.enable_confirms(), feeder);
    enabled.expect("confirm select handshake");
}
