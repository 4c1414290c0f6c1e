//! Consumer registry and delivery dispatch.
//!
//! The reader never runs consumer callbacks. Each registered consumer owns an
//! unbounded queue and a dispatch task; the reader's part of a delivery is a
//! queue push. Per-tag delivery order follows frame arrival order; nothing is
//! promised across tags. A panicking callback loses that one delivery, the
//! dispatch loop keeps going.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use wiremq_protocol::Delivery;

use crate::error::{ChannelError, Result};

/// Callback invoked once per delivery, in arrival order, off the reader task.
pub type DeliveryHandler = Box<dyn FnMut(Delivery) + Send>;

/// Consumers registered on one channel, keyed by consumer tag.
pub struct ConsumerRegistry {
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    next_tag: AtomicU64,
    tag_prefix: String,
}

impl ConsumerRegistry {
    /// Creates an empty registry. Generated tags are `{tag_prefix}-{n}`.
    pub fn new(tag_prefix: String) -> Self {
        ConsumerRegistry {
            consumers: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            tag_prefix,
        }
    }

    /// Allocates the next generated consumer tag.
    pub fn generate_tag(&self) -> String {
        let n = self.next_tag.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.tag_prefix, n)
    }

    /// Registers `handler` under `tag` and starts its dispatch task. The
    /// task ends when the consumer is removed and its queue has drained.
    ///
    /// Must be called from within a tokio runtime.
    pub fn insert(&self, tag: &str, mut handler: DeliveryHandler) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        {
            let mut consumers = self.consumers.lock().unwrap();
            if consumers.contains_key(tag) {
                return Err(ChannelError::usage(format!(
                    "consumer tag already in use: {tag}"
                )));
            }
            consumers.insert(tag.to_string(), tx);
        }
        let task_tag = tag.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let delivery_tag = delivery.delivery_tag;
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    handler(delivery);
                }));
                if outcome.is_err() {
                    warn!(
                        consumer_tag = %task_tag,
                        delivery_tag,
                        "consumer callback panicked, delivery lost"
                    );
                }
            }
            debug!(consumer_tag = %task_tag, "consumer dispatch ended");
        });
        debug!(consumer_tag = %tag, "consumer registered");
        Ok(())
    }

    /// Hands a delivery to its consumer's queue. Returns false when no
    /// consumer owns the tag (the delivery is dropped).
    pub fn dispatch(&self, delivery: Delivery) -> bool {
        let consumers = self.consumers.lock().unwrap();
        match consumers.get(&delivery.consumer_tag) {
            Some(tx) => tx.send(delivery).is_ok(),
            None => {
                warn!(
                    consumer_tag = %delivery.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    "delivery for unknown consumer, dropping"
                );
                false
            }
        }
    }

    /// Removes a consumer. Deliveries already queued still reach the
    /// callback; the dispatch task ends once the queue drains. Returns
    /// false when the tag was not registered.
    pub fn remove(&self, tag: &str) -> bool {
        let removed = self.consumers.lock().unwrap().remove(tag).is_some();
        if removed {
            debug!(consumer_tag = %tag, "consumer removed");
        }
        removed
    }

    /// Removes every consumer, ending all dispatch tasks after their queues
    /// drain. Used when the channel leaves the open state.
    pub fn clear(&self) {
        let mut consumers = self.consumers.lock().unwrap();
        if !consumers.is_empty() {
            debug!(count = consumers.len(), "clearing consumers");
        }
        consumers.clear();
    }

    /// True when a consumer owns `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.consumers.lock().unwrap().contains_key(tag)
    }

    /// Number of registered consumers.
    pub fn len(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }

    /// True when no consumer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
