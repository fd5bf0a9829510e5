//! Exponential backoff driven by BACKOFF acknowledgments.

use std::time::{Duration, Instant};

/// Receiver-requested pause of the delivery loop.
///
/// Each consecutive BACKOFF doubles the next delay up to `max`; a clean ACK
/// resets it to `initial`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    until: Option<Instant>,
}

impl Backoff {
    /// Create with an initial delay and a ceiling.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            next: initial,
            until: None,
        }
    }

    /// Start a pause now, returning its length.
    pub fn trigger(&mut self) -> Duration {
        self.trigger_at(Instant::now())
    }

    /// Start a pause at `now`, returning its length.
    pub fn trigger_at(&mut self, now: Instant) -> Duration {
        let delay = self.next;
        self.next = delay.saturating_mul(2).min(self.max);
        self.until = Some(now + delay);
        delay
    }

    /// Clean ACK: the next pause starts from `initial` again.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    /// The pause ran out.
    pub fn expire(&mut self) {
        self.until = None;
    }

    /// Delay the next trigger would use.
    pub fn next_delay(&self) -> Duration {
        self.next
    }

    /// True while a pause is running at `now`.
    pub fn is_active_at(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// Deadline of the running pause.
    pub fn deadline(&self) -> Option<Instant> {
        self.until
    }
}
