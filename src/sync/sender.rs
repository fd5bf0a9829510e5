//! Sender-side delivery loop state
//!
//! The loop runs on a timer and can be woken early. It pulls unsent queue
//! entries in order and switches itself off once the queue reports nothing
//! more to send.

use crate::core::{DEFAULT_SENDER_BATCH, PeerId, QueuedMessage, Store, StoreResult};

/// On/off state of one destination's delivery loop
#[derive(Debug, Clone)]
pub struct OutboundSender {
    /// Loop should run on the next tick
    active: bool,

    /// Entries pulled per tick
    batch: usize,

    /// Entries pulled during the current tick
    pulled: usize,
}

impl Default for OutboundSender {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundSender {
    /// Create an idle sender
    pub fn new() -> Self {
        Self::with_batch(DEFAULT_SENDER_BATCH)
    }

    /// Create an idle sender with a custom per-tick batch
    pub fn with_batch(batch: usize) -> Self {
        Self {
            active: false,
            batch: batch.max(1),
            pulled: 0,
        }
    }

    /// Request a run (enqueue, resend, backoff expiry, login)
    pub fn wake(&mut self) {
        self.active = true;
    }

    /// Switch off until the next wake
    pub fn stop(&mut self) {
        self.active = false;
    }

    /// Whether the loop wants to run
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start a new tick
    pub fn begin_tick(&mut self) {
        self.pulled = 0;
    }

    /// Pull the next unsent entry for `destination`, if this tick may.
    ///
    /// Does not mark the entry sent; the caller does that after the write.
    pub fn pull(
        &mut self,
        store: &dyn Store,
        destination: &PeerId,
    ) -> StoreResult<Option<QueuedMessage>> {
        if !self.active || self.pulled >= self.batch {
            return Ok(None);
        }

        let next = store.next_unsent(destination)?;
        match &next {
            Some(message) => {
                self.pulled += 1;
                if !message.more_pending {
                    self.active = false;
                }
            }
            None => self.active = false,
        }
        Ok(next)
    }
}
