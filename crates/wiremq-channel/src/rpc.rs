//! RPC correlation table: outstanding requests keyed by expected reply kind.
//!
//! Replies carry no correlation id. The wire contract is that the broker
//! answers requests of one method pair in the order they were sent on the
//! channel, so each expected reply kind keeps a FIFO of pending entries and
//! an inbound reply resolves the front one. Requests of different pairs never
//! serialize behind each other.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};
use wiremq_protocol::{Method, MethodKind};

use crate::completion::CompletionCell;
use crate::error::{ChannelError, Result};

struct PendingRpc {
    id: u64,
    cell: Arc<CompletionCell>,
    registered_at: Instant,
}

#[derive(Default)]
struct PendingTable {
    by_kind: HashMap<MethodKind, VecDeque<PendingRpc>>,
    total: usize,
}

/// Correlation table for in-flight RPCs on one channel.
pub struct RpcManager {
    table: Mutex<PendingTable>,
    next_id: AtomicU64,
    max_in_flight: usize,
}

impl RpcManager {
    /// Creates an empty table capped at `max_in_flight` outstanding entries.
    pub fn new(max_in_flight: usize) -> Self {
        RpcManager {
            table: Mutex::new(PendingTable::default()),
            next_id: AtomicU64::new(1),
            max_in_flight,
        }
    }

    /// Registers a pending entry expecting a reply of kind `expected`.
    /// Returns a registration id usable with [`RpcManager::remove`].
    pub fn register(&self, expected: MethodKind, cell: Arc<CompletionCell>) -> Result<u64> {
        let mut table = self.table.lock().unwrap();
        if table.total >= self.max_in_flight {
            return Err(ChannelError::usage(format!(
                "too many in-flight rpcs (max {})",
                self.max_in_flight
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        table.by_kind.entry(expected).or_default().push_back(PendingRpc {
            id,
            cell,
            registered_at: Instant::now(),
        });
        table.total += 1;
        debug!(kind = ?expected, id, in_flight = table.total, "rpc registered");
        Ok(id)
    }

    /// Resolves the oldest pending entry expecting `reply`'s kind. Returns
    /// false if nothing was waiting for that kind (the reply is dropped).
    pub fn resolve(&self, reply: Method) -> bool {
        let kind = reply.kind();
        let entry = {
            let mut table = self.table.lock().unwrap();
            let entry = table.by_kind.get_mut(&kind).and_then(VecDeque::pop_front);
            if entry.is_some() {
                table.total -= 1;
            }
            entry
        };
        match entry {
            Some(entry) => {
                debug!(
                    kind = ?kind,
                    id = entry.id,
                    elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "rpc resolved"
                );
                // Resolve outside the table lock: an inline continuation may
                // register the next rpc in the chain.
                entry.cell.resolve(Ok(reply));
                true
            }
            None => {
                warn!(kind = ?kind, "reply with no pending request, dropping");
                false
            }
        }
    }

    /// Removes a still-pending registration by id. Returns false if it was
    /// already resolved or removed.
    pub fn remove(&self, expected: MethodKind, id: u64) -> bool {
        let mut table = self.table.lock().unwrap();
        let Some(queue) = table.by_kind.get_mut(&expected) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|entry| entry.id == id) else {
            return false;
        };
        queue.remove(pos);
        table.total -= 1;
        true
    }

    /// Fails every pending entry with a copy of `error` and empties the
    /// table. Returns how many entries were failed.
    pub fn fail_all(&self, error: &ChannelError) -> usize {
        let drained = {
            let mut table = self.table.lock().unwrap();
            table.total = 0;
            std::mem::take(&mut table.by_kind)
        };
        let mut failed = 0usize;
        for queue in drained.into_values() {
            for entry in queue {
                entry.cell.resolve(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(failed, error = %error, "failed all pending rpcs");
        }
        failed
    }

    /// Number of entries currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.table.lock().unwrap().total
    }
}

impl Drop for RpcManager {
    fn drop(&mut self) {
        let Ok(table) = self.table.get_mut() else {
            return;
        };
        let drained = std::mem::take(table);
        if drained.total > 0 {
            warn!(
                pending = drained.total,
                "correlation table dropped with unresolved entries"
            );
        }
        for queue in drained.by_kind.into_values() {
            for entry in queue {
                entry.cell.resolve(Err(ChannelError::ReplyDropped));
            }
        }
    }
}
