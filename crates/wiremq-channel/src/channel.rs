//! The channel: RPC submission, publishing, consuming, lifecycle.
//!
//! A channel multiplexes synchronous-looking protocol operations over one
//! ordered connection. Callers submit RPCs, publish, and register consumers
//! from any task; the connection's reader feeds every inbound frame to
//! [`Channel::handle_frame`], one at a time, in arrival order. Nothing on
//! the inbound path blocks: replies resolve completion cells, confirms
//! settle the window, deliveries are queue pushes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use wiremq_protocol::{classify, Frame, Inbound, Method, MethodKind};

use crate::completion::CompletionCell;
use crate::config::ChannelConfig;
use crate::confirms::{ConfirmTracker, EnableStart};
use crate::consumer::{ConsumerRegistry, DeliveryHandler};
use crate::error::{ChannelError, Result};
use crate::executor::Executor;
use crate::handle::RpcHandle;
use crate::metrics::{ChannelMetrics, MetricsSnapshot};
use crate::rpc::RpcManager;
use crate::status::{ChannelState, ChannelStatus};
use crate::transport::FrameTransport;

/// Reply code for an orderly close.
pub const REPLY_SUCCESS: u16 = 200;

/// A protocol channel multiplexed over one connection.
///
/// Cloning is cheap; clones share all channel state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: u16,
    config: ChannelConfig,
    transport: Arc<dyn FrameTransport>,
    state: ChannelStatus,
    rpc: RpcManager,
    confirms: ConfirmTracker,
    consumers: ConsumerRegistry,
    metrics: ChannelMetrics,
    // Resolved once the close handshake finishes, however it finishes.
    closed_cell: Arc<CompletionCell>,
}

impl Channel {
    /// Opens a channel with the given id over `transport`.
    pub fn new(id: u16, transport: Arc<dyn FrameTransport>, config: ChannelConfig) -> Self {
        let consumers = ConsumerRegistry::new(config.consumer_tag_prefix.clone());
        let rpc = RpcManager::new(config.max_in_flight_rpcs);
        Channel {
            inner: Arc::new(ChannelInner {
                id,
                config,
                transport,
                state: ChannelStatus::new(),
                rpc,
                confirms: ConfirmTracker::new(),
                consumers,
                metrics: ChannelMetrics::new(),
                closed_cell: Arc::new(CompletionCell::new(None)),
            }),
        }
    }

    /// The channel id frames are addressed with.
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.state.current()
    }

    /// True while the channel accepts new operations.
    pub fn is_open(&self) -> bool {
        self.inner.state.is_open()
    }

    /// The close reason, once one was recorded.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.state.close_reason()
    }

    /// Snapshot of the channel's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Submits an RPC and returns an unresolved handle immediately.
    ///
    /// Continuations attached to the handle without an executor run inline
    /// on the resolving task; see [`RpcHandle::on_complete`].
    pub fn async_rpc(&self, method: Method) -> Result<RpcHandle> {
        self.async_rpc_with(method, None)
    }

    /// Like [`async_rpc`], but continuations attached to the handle without
    /// an executor of their own run on `executor`. Chained handles inherit
    /// it.
    ///
    /// [`async_rpc`]: Channel::async_rpc
    pub fn async_rpc_on(&self, method: Method, executor: Arc<dyn Executor>) -> Result<RpcHandle> {
        self.async_rpc_with(method, Some(executor))
    }

    fn async_rpc_with(
        &self,
        method: Method,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<RpcHandle> {
        let cell = Arc::new(CompletionCell::new(executor));
        self.submit_with_cell(method, cell.clone())?;
        Ok(RpcHandle::new(self.clone(), cell))
    }

    /// Submits an RPC and waits for its reply, bounded by the configured
    /// RPC timeout. See [`RpcHandle::wait_timeout`] for what a timeout
    /// leaves behind.
    pub async fn rpc(&self, method: Method) -> Result<Method> {
        let timeout = self.inner.config.rpc_timeout;
        self.async_rpc(method)?.wait_timeout(timeout).await
    }

    /// Registers `cell` for `method`'s expected reply and sends the frame.
    /// On error the cell is neither registered nor resolved.
    pub(crate) fn submit_with_cell(&self, method: Method, cell: Arc<CompletionCell>) -> Result<()> {
        let kind = method.kind();
        if kind == MethodKind::ChannelClose {
            return Err(ChannelError::usage(
                "channel.close is sent by close(), not as a plain rpc",
            ));
        }
        let expected = kind.expected_reply().ok_or_else(|| {
            ChannelError::usage(format!("{kind:?} expects no reply"))
        })?;
        self.ensure_open()?;
        let id = self.inner.rpc.register(expected, cell)?;
        if !self.inner.state.is_open() {
            // Lost the race with a closer; our entry may have missed the
            // table sweep.
            self.inner.rpc.remove(expected, id);
            return Err(ChannelError::closed(
                self.inner.state.reason_or("channel closing"),
            ));
        }
        if let Err(error) = self.send(method) {
            self.inner.rpc.remove(expected, id);
            return Err(error);
        }
        self.inner.metrics.inc_rpcs_sent();
        debug!(channel = self.inner.id, kind = ?kind, "rpc sent");
        Ok(())
    }

    /// Puts the channel into publisher-confirm mode. Idempotent: once in
    /// confirm mode further calls return without another round trip, and
    /// concurrent calls share a single select round trip. Fails with a
    /// usage error after the first publish.
    pub async fn enable_confirms(&self) -> Result<()> {
        let flight = loop {
            self.ensure_open()?;
            match self.inner.confirms.begin_enable()? {
                EnableStart::AlreadyEnabled => return Ok(()),
                EnableStart::Started(flight) => break flight,
                EnableStart::InFlight => self.inner.confirms.enable_settled().await,
            }
        };
        self.rpc(Method::ConfirmSelect).await?;
        flight.complete()
    }

    /// True once the channel is in confirm mode.
    pub fn confirms_enabled(&self) -> bool {
        self.inner.confirms.is_enabled()
    }

    /// Publishes a message. In confirm mode, returns the strictly increasing
    /// sequence number assigned to it; otherwise returns 0.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<u64> {
        self.ensure_open()?;
        let method = Method::BasicPublish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
        };
        let seq = self.inner.confirms.track_publish(|| self.send(method))?;
        self.inner.metrics.inc_publishes();
        debug!(channel = self.inner.id, seq, "message published");
        Ok(seq)
    }

    /// Waits until every outstanding publish is confirmed, a nack is on the
    /// ledger, or `timeout` elapses. A timeout abandons only the wait; the
    /// window is untouched and the wait can be retried.
    pub async fn await_confirms(&self, timeout: Duration) -> Result<()> {
        let result = self.inner.confirms.await_all(timeout).await;
        if matches!(result, Err(ChannelError::Timeout { .. })) {
            self.inner.metrics.inc_confirm_timeouts();
        }
        result
    }

    /// Like [`await_confirms`], but a nack or timeout also closes the
    /// channel before the error is returned.
    ///
    /// [`await_confirms`]: Channel::await_confirms
    pub async fn wait_for_confirms_or_die(&self, timeout: Duration) -> Result<()> {
        match self.await_confirms(timeout).await {
            Ok(()) => Ok(()),
            Err(error @ ChannelError::Nack { .. }) => {
                warn!(channel = self.inner.id, error = %error, "nack received, closing channel");
                self.close_with(REPLY_SUCCESS, "nacks received").await?;
                Err(error)
            }
            Err(error @ ChannelError::Timeout { .. }) => {
                warn!(channel = self.inner.id, error = %error, "confirms timed out, closing channel");
                self.close_with(REPLY_SUCCESS, "timeout waiting for confirms")
                    .await?;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Starts a consumer on `queue` with a generated tag. Returns the tag.
    /// The callback runs on the consumer's own dispatch task, never on the
    /// reader; per-tag delivery order follows frame arrival order.
    pub async fn register_consumer(&self, queue: &str, handler: DeliveryHandler) -> Result<String> {
        let tag = self.inner.consumers.generate_tag();
        self.consume_with_tag(queue, tag, handler).await
    }

    /// Starts a consumer with a caller-chosen tag.
    pub async fn register_consumer_with_tag(
        &self,
        queue: &str,
        tag: &str,
        handler: DeliveryHandler,
    ) -> Result<String> {
        if tag.is_empty() {
            return Err(ChannelError::usage("consumer tag must not be empty"));
        }
        self.consume_with_tag(queue, tag.to_string(), handler).await
    }

    async fn consume_with_tag(
        &self,
        queue: &str,
        tag: String,
        handler: DeliveryHandler,
    ) -> Result<String> {
        self.ensure_open()?;
        // Register before the consume goes out: the first delivery can beat
        // the consume-ok back to us.
        self.inner.consumers.insert(&tag, handler)?;
        let consume = Method::BasicConsume {
            queue: queue.to_string(),
            consumer_tag: tag.clone(),
        };
        match self.rpc(consume).await {
            Ok(_consume_ok) => {
                info!(channel = self.inner.id, consumer_tag = %tag, queue, "consumer started");
                Ok(tag)
            }
            Err(error) => {
                self.inner.consumers.remove(&tag);
                Err(error)
            }
        }
    }

    /// Stops a consumer. Deliveries already queued for it still reach the
    /// callback; nothing new is dispatched afterwards.
    pub async fn cancel_consumer(&self, tag: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.inner.consumers.contains(tag) {
            return Err(ChannelError::usage(format!("no such consumer: {tag}")));
        }
        self.rpc(Method::BasicCancel {
            consumer_tag: tag.to_string(),
        })
        .await?;
        self.inner.consumers.remove(tag);
        info!(channel = self.inner.id, consumer_tag = %tag, "consumer cancelled");
        Ok(())
    }

    /// Closes the channel with reply code 200. Pending RPCs and confirm
    /// waits fail with the close reason, consumers stop, then the close
    /// handshake runs, bounded by the configured close timeout (the channel
    /// is forced closed when the peer never answers). Calling close on a
    /// closing or closed channel just waits for the handshake to finish.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "Normal close").await
    }

    /// Closes the channel with an explicit reply code and text.
    pub async fn close_with(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        if !self.inner.state.begin_close(reply_text) {
            // Someone else is closing; wait out their handshake.
            let _ = tokio::time::timeout(
                self.inner.config.close_timeout,
                self.inner.closed_cell.wait(),
            )
            .await;
            return Ok(());
        }
        info!(channel = self.inner.id, code = reply_code, text = reply_text, "closing channel");
        self.shutdown_work(reply_text);
        let close = Method::ChannelClose {
            reply_code,
            reply_text: reply_text.to_string(),
        };
        if let Err(error) = self.send(close) {
            debug!(channel = self.inner.id, error = %error, "could not send channel.close");
            self.finish_closed();
            return Ok(());
        }
        let wait = tokio::time::timeout(
            self.inner.config.close_timeout,
            self.inner.closed_cell.wait(),
        )
        .await;
        if wait.is_err() {
            warn!(channel = self.inner.id, "no close-ok within timeout, forcing closed");
            self.finish_closed();
        }
        Ok(())
    }

    /// Tears the channel down after a transport or reader failure. No close
    /// handshake is attempted; everything pending fails with `reason`.
    pub fn handle_io_failure(&self, reason: &str) {
        warn!(channel = self.inner.id, reason, "transport failure, tearing down channel");
        self.inner.state.force_closed(reason);
        self.shutdown_work(reason);
        self.inner
            .closed_cell
            .resolve(Err(ChannelError::closed(reason)));
    }

    /// Feeds one inbound frame to the channel. Called by the connection
    /// reader, one frame at a time, in arrival order. Never blocks: consumer
    /// callbacks and executor-bound continuations run elsewhere. Inline
    /// continuations do run here, which is why they must stay non-blocking.
    pub fn handle_frame(&self, frame: Frame) {
        if frame.channel_id != self.inner.id {
            warn!(
                channel = self.inner.id,
                got = frame.channel_id,
                "frame for another channel, dropping"
            );
            return;
        }
        match classify(frame.method) {
            Inbound::Reply(reply) => {
                if self.inner.rpc.resolve(reply) {
                    self.inner.metrics.inc_rpcs_completed();
                }
            }
            Inbound::Ack {
                delivery_tag,
                multiple,
            } => {
                let cleared = self.inner.confirms.on_ack(delivery_tag, multiple);
                self.inner.metrics.add_confirms_acked(cleared as u64);
            }
            Inbound::Nack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                let rejected = self.inner.confirms.on_nack(delivery_tag, multiple, requeue);
                self.inner.metrics.add_confirms_nacked(rejected as u64);
            }
            Inbound::Delivery(delivery) => {
                if self.inner.consumers.dispatch(delivery) {
                    self.inner.metrics.inc_deliveries_dispatched();
                } else {
                    self.inner.metrics.inc_deliveries_dropped();
                }
            }
            Inbound::Close {
                reply_code,
                reply_text,
            } => self.on_remote_close(reply_code, &reply_text),
            Inbound::CloseOk => self.on_close_ok(),
            Inbound::Unexpected(method) => {
                warn!(
                    channel = self.inner.id,
                    kind = ?method.kind(),
                    "unexpected inbound method, dropping"
                );
            }
        }
    }

    fn on_remote_close(&self, reply_code: u16, reply_text: &str) {
        let reason = format!("closed by peer: {reply_code} {reply_text}");
        info!(channel = self.inner.id, code = reply_code, text = reply_text, "remote close");
        self.inner.state.begin_close(&reason);
        self.shutdown_work(&reason);
        // Acknowledge regardless of who started closing; the peer waits
        // for it. A local close racing us stops waiting via closed_cell.
        if let Err(error) = self.send(Method::ChannelCloseOk) {
            debug!(channel = self.inner.id, error = %error, "could not send close-ok");
        }
        self.finish_closed();
    }

    fn on_close_ok(&self) {
        if self.inner.state.current() == ChannelState::Open {
            warn!(channel = self.inner.id, "close-ok without close in progress, dropping");
            return;
        }
        debug!(channel = self.inner.id, "close-ok received");
        self.finish_closed();
    }

    fn finish_closed(&self) {
        self.inner.state.finish_close();
        self.inner.closed_cell.resolve(Ok(Method::ChannelCloseOk));
    }

    fn shutdown_work(&self, reason: &str) {
        let failed = self.inner.rpc.fail_all(&ChannelError::closed(reason));
        if failed > 0 {
            self.inner.metrics.add_rpcs_failed(failed as u64);
        }
        self.inner.confirms.fail(reason);
        self.inner.consumers.clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.state.is_open() {
            Ok(())
        } else {
            Err(ChannelError::closed(
                self.inner.state.reason_or("channel not open"),
            ))
        }
    }

    fn send(&self, method: Method) -> Result<()> {
        self.inner
            .transport
            .send_frame(Frame::new(self.inner.id, method))?;
        Ok(())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.current())
            .field("in_flight_rpcs", &self.inner.rpc.in_flight())
            .field("consumers", &self.inner.consumers.len())
            .finish()
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if self.state.current() != ChannelState::Closed {
            // Dropped without close(); nothing may be left waiting forever.
            let failed = self.rpc.fail_all(&ChannelError::closed("channel dropped"));
            if failed > 0 {
                self.metrics.add_rpcs_failed(failed as u64);
            }
            self.confirms.fail("channel dropped");
            self.consumers.clear();
        }
    }
}
