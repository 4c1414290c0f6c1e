//! Publisher-confirm window.
//!
//! Once the channel enters confirm mode every publish is assigned a strictly
//! increasing sequence number, starting at 1. The broker settles numbers with
//! acks and nacks, singly or for a whole prefix with `multiple`. Waiters ask
//! for the window to drain: success means every assigned number was settled
//! positively; any nack fails the wait naming a rejected number; a timeout
//! abandons only the wait and leaves the window intact for a retry.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};

#[derive(Default)]
struct ConfirmWindow {
    enabled: bool,
    // A confirm.select round trip is in flight; at most one at a time.
    enabling: bool,
    published_any: bool,
    next_seq: u64,
    // When each unsettled seqno was published.
    outstanding: BTreeMap<u64, Instant>,
    nacked: Vec<u64>,
    closed: Option<String>,
}

/// Tracks outstanding publish sequence numbers and settles them against
/// broker acks and nacks.
pub struct ConfirmTracker {
    window: Mutex<ConfirmWindow>,
    changed: Notify,
}

/// How an enable attempt proceeds; returned by
/// [`ConfirmTracker::begin_enable`].
pub enum EnableStart<'a> {
    /// Confirm mode is already on; nothing to send.
    AlreadyEnabled,
    /// The caller owns the confirm.select round trip.
    Started(EnableFlight<'a>),
    /// Another caller's round trip is in flight.
    InFlight,
}

/// Exclusive claim on the confirm.select handshake.
///
/// Dropping an incomplete flight releases the claim so another caller may
/// try again.
pub struct EnableFlight<'a> {
    tracker: &'a ConfirmTracker,
    done: bool,
}

impl EnableFlight<'_> {
    /// Turns confirm mode on and wakes anyone waiting on the handshake.
    pub fn complete(mut self) -> Result<()> {
        self.done = true;
        self.tracker.enable()
    }
}

impl Drop for EnableFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.tracker.abort_enable();
        }
    }
}

impl ConfirmTracker {
    /// Creates a tracker with confirm mode off.
    pub fn new() -> Self {
        ConfirmTracker {
            window: Mutex::new(ConfirmWindow::default()),
            changed: Notify::new(),
        }
    }

    /// True once confirm mode is on.
    pub fn is_enabled(&self) -> bool {
        self.window.lock().unwrap().enabled
    }

    /// Claims or observes the confirm.select handshake.
    ///
    /// At most one handshake is in flight at a time: the first caller gets
    /// [`EnableStart::Started`] and owns the round trip, concurrent callers
    /// get [`EnableStart::InFlight`] and wait via [`enable_settled`]. Fails
    /// if something was already published or the window was failed.
    ///
    /// [`enable_settled`]: ConfirmTracker::enable_settled
    pub fn begin_enable(&self) -> Result<EnableStart<'_>> {
        let mut window = self.window.lock().unwrap();
        if let Some(reason) = &window.closed {
            return Err(ChannelError::closed(reason.clone()));
        }
        if window.enabled {
            return Ok(EnableStart::AlreadyEnabled);
        }
        if window.published_any {
            return Err(ChannelError::usage(
                "confirms must be enabled before the first publish",
            ));
        }
        if window.enabling {
            return Ok(EnableStart::InFlight);
        }
        window.enabling = true;
        Ok(EnableStart::Started(EnableFlight {
            tracker: self,
            done: false,
        }))
    }

    /// Turns confirm mode on and settles the in-flight handshake, waking
    /// its waiters. Idempotent: enabling an enabled tracker changes
    /// nothing. Fails if something was already published.
    pub fn enable(&self) -> Result<()> {
        let result = {
            let mut window = self.window.lock().unwrap();
            window.enabling = false;
            if window.enabled {
                Ok(())
            } else if window.published_any {
                Err(ChannelError::usage(
                    "confirms must be enabled before the first publish",
                ))
            } else {
                window.enabled = true;
                window.next_seq = 1;
                debug!("publisher confirms enabled");
                Ok(())
            }
        };
        self.changed.notify_waiters();
        result
    }

    fn abort_enable(&self) {
        self.window.lock().unwrap().enabling = false;
        self.changed.notify_waiters();
    }

    /// Waits until no confirm.select handshake is in flight. The handshake
    /// may have failed; callers re-check [`begin_enable`] afterwards.
    ///
    /// [`begin_enable`]: ConfirmTracker::begin_enable
    pub async fn enable_settled(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.window.lock().unwrap().enabling {
                return;
            }
            notified.await;
        }
    }

    /// Runs `send` for one publish and tracks its sequence number.
    ///
    /// The number is allocated and `send` runs under the window lock, so
    /// wire order always matches sequence order. A failed send allocates
    /// nothing. Returns 0 when confirm mode is off. Once the window was
    /// failed the publish is refused with the close reason; [`fail`] holds
    /// the same lock, so no entry lands behind its sweep.
    ///
    /// [`fail`]: ConfirmTracker::fail
    pub fn track_publish<F>(&self, send: F) -> Result<u64>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut window = self.window.lock().unwrap();
        if let Some(reason) = &window.closed {
            return Err(ChannelError::closed(reason.clone()));
        }
        if !window.enabled {
            send()?;
            window.published_any = true;
            return Ok(0);
        }
        let seq = window.next_seq;
        send()?;
        window.published_any = true;
        window.next_seq += 1;
        window.outstanding.insert(seq, Instant::now());
        debug!(seq, outstanding = window.outstanding.len(), "publish tracked");
        Ok(seq)
    }

    /// Settles numbers positively. With `multiple`, every outstanding number
    /// up to and including `tag` clears (tag 0 clears the whole window).
    /// Returns how many numbers cleared.
    pub fn on_ack(&self, tag: u64, multiple: bool) -> usize {
        let cleared = {
            let mut window = self.window.lock().unwrap();
            if !window.enabled {
                warn!(tag, "ack on a channel without confirms, ignoring");
                return 0;
            }
            let covered = Self::take_covered(&mut window, tag, multiple);
            if covered.is_empty() && !multiple {
                warn!(tag, "ack for unknown seqno, ignoring");
            }
            for (seq, published_at) in &covered {
                let age_ms = published_at.elapsed().as_millis() as u64;
                debug!(seq = *seq, age_ms, multiple, "publish confirmed");
            }
            covered.len()
        };
        if cleared > 0 {
            self.changed.notify_waiters();
        }
        cleared
    }

    /// Settles numbers negatively; the same coverage rules as [`on_ack`]
    /// apply. Rejected numbers go on the nack ledger, which is sticky: once
    /// a number was nacked, waits keep failing until the channel goes away.
    ///
    /// [`on_ack`]: ConfirmTracker::on_ack
    pub fn on_nack(&self, tag: u64, multiple: bool, requeue: bool) -> usize {
        let rejected = {
            let mut window = self.window.lock().unwrap();
            if !window.enabled {
                warn!(tag, "nack on a channel without confirms, ignoring");
                return 0;
            }
            let covered = Self::take_covered(&mut window, tag, multiple);
            if covered.is_empty() && !multiple {
                warn!(tag, "nack for unknown seqno, ignoring");
                return 0;
            }
            let rejected = covered.len();
            window.nacked.extend(covered.into_iter().map(|(seq, _)| seq));
            rejected
        };
        warn!(tag, multiple, requeue, rejected, "broker nacked publish");
        self.changed.notify_waiters();
        rejected
    }

    /// Number of sequence numbers still unsettled.
    pub fn outstanding_count(&self) -> usize {
        self.window.lock().unwrap().outstanding.len()
    }

    /// Waits until the window drains, a nack is on the ledger, or `timeout`
    /// elapses, whichever happens first. Timeout abandons only the wait.
    /// Waiting without confirm mode on is a usage error.
    pub async fn await_all(&self, timeout: Duration) -> Result<()> {
        {
            let window = self.window.lock().unwrap();
            if !window.enabled {
                return Err(ChannelError::usage(
                    "confirms not enabled on this channel",
                ));
            }
        }
        match tokio::time::timeout(timeout, self.drained()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Fails current and future waits with a closed error carrying `reason`.
    /// The first recorded reason wins.
    pub fn fail(&self, reason: &str) {
        {
            let mut window = self.window.lock().unwrap();
            if window.closed.is_none() {
                window.closed = Some(reason.to_string());
            }
        }
        self.changed.notify_waiters();
    }

    async fn drained(&self) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Arm before checking so a settle that lands in between is kept.
            notified.as_mut().enable();
            {
                let window = self.window.lock().unwrap();
                if let Some(reason) = &window.closed {
                    return Err(ChannelError::closed(reason.clone()));
                }
                if let Some(&seq) = window.nacked.iter().min() {
                    return Err(ChannelError::Nack { sequence: seq });
                }
                if window.outstanding.is_empty() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn take_covered(window: &mut ConfirmWindow, tag: u64, multiple: bool) -> Vec<(u64, Instant)> {
        if multiple {
            // Tag 0 with multiple covers everything outstanding.
            let covered = if tag == 0 {
                std::mem::take(&mut window.outstanding)
            } else {
                let kept = window.outstanding.split_off(&tag.saturating_add(1));
                std::mem::replace(&mut window.outstanding, kept)
            };
            covered.into_iter().collect()
        } else {
            window
                .outstanding
                .remove(&tag)
                .map(|published_at| (tag, published_at))
                .into_iter()
                .collect()
        }
    }
}

impl Default for ConfirmTracker {
    fn default() -> Self {
        Self::new()
    }
}
