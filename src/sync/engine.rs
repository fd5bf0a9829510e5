//! Delivery engine
//!
//! Per-connection reliable-delivery decisions. The engine owns the receive
//! sequence, the out-of-sync counter, the backoff timer, and the delivery
//! loop switch; the connection handler applies its verdicts to the store
//! and the socket.

use std::time::{Duration, Instant};

use super::backoff::Backoff;
use super::receiver::{SequenceCheck, SequenceTracker};
use super::sender::OutboundSender;
use crate::core::{
    DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_OUT_OF_SYNC_MAX, DEFAULT_SENDER_BATCH,
    PeerId, QueuedMessage, Store, StoreResult,
};
use crate::transport::Header;

/// Tunables for one population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Out-of-sync events tolerated before flush-and-close.
    pub out_of_sync_max: u32,
    /// First backoff pause.
    pub backoff_initial: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Queue entries written per delivery tick.
    pub sender_batch: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            out_of_sync_max: DEFAULT_OUT_OF_SYNC_MAX,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            sender_batch: DEFAULT_SENDER_BATCH,
        }
    }
}

/// Recovery action after an out-of-sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Nothing to do.
    None,
    /// Mark every unacknowledged entry unsent; the sender is already woken.
    ResendUnacked,
    /// Flush the peer's queue and close the connection.
    FlushAndClose,
}

/// Decision for an inbound data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundVerdict {
    /// Sequence classification.
    pub check: SequenceCheck,
    /// Header of the ACK to send back.
    pub ack: Header,
    /// Payload is fresh and must be processed (relayed or interpreted).
    pub deliver: bool,
    /// Receive sequence to persist before anything else.
    pub persist: Option<u32>,
    /// Out-of-sync recovery.
    pub escalation: Escalation,
}

/// Decision for an inbound acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckVerdict {
    /// Mark `sequence` acknowledged in the store.
    Acknowledged {
        /// Acknowledged sequence.
        sequence: u32,
    },
    /// Peer saw a gap; do not acknowledge, recover instead.
    OutOfSync {
        /// Sequence the peer rejected.
        sequence: u32,
        /// Recovery action.
        escalation: Escalation,
    },
    /// Peer is overloaded; mark `sequence` unsent and pause for `delay`.
    Backoff {
        /// Sequence to redeliver.
        sequence: u32,
        /// Pause length.
        delay: Duration,
    },
}

/// Reliable-delivery state of one connection.
#[derive(Debug)]
pub struct DeliveryEngine {
    tracker: SequenceTracker,
    out_of_sync: u32,
    out_of_sync_max: u32,
    backoff: Backoff,
    sender: OutboundSender,
}

impl DeliveryEngine {
    /// Create with the receive baseline established at authentication.
    pub fn new(config: DeliveryConfig, baseline: u32) -> Self {
        Self {
            tracker: SequenceTracker::new(baseline),
            out_of_sync: 0,
            out_of_sync_max: config.out_of_sync_max,
            backoff: Backoff::new(config.backoff_initial, config.backoff_max),
            sender: OutboundSender::with_batch(config.sender_batch),
        }
    }

    /// Last sequence accepted from the peer.
    pub fn receive_sequence(&self) -> u32 {
        self.tracker.current()
    }

    /// Consecutive out-of-sync events so far.
    pub fn out_of_sync_count(&self) -> u32 {
        self.out_of_sync
    }

    /// Classify a sequenced (non-notification, non-ACK) frame.
    pub fn on_data(&mut self, sequence: u32) -> InboundVerdict {
        let check = self.tracker.accept(sequence);
        match check {
            SequenceCheck::Fresh => {
                self.out_of_sync = 0;
                InboundVerdict {
                    check,
                    ack: Header::ACK | Header::PROCESSED,
                    deliver: true,
                    persist: Some(sequence),
                    escalation: Escalation::None,
                }
            }
            SequenceCheck::Duplicate { .. } => InboundVerdict {
                check,
                ack: Header::ACK,
                deliver: false,
                persist: None,
                escalation: Escalation::None,
            },
            SequenceCheck::Gap { .. } => InboundVerdict {
                check,
                ack: Header::ACK | Header::OUT_OF_SYNC,
                deliver: false,
                persist: None,
                escalation: self.escalate(),
            },
        }
    }

    /// Interpret an acknowledgment of one of our frames.
    pub fn on_ack(&mut self, header: Header, sequence: u32) -> AckVerdict {
        self.on_ack_at(header, sequence, Instant::now())
    }

    /// [`on_ack`](Self::on_ack) with an explicit clock.
    pub fn on_ack_at(&mut self, header: Header, sequence: u32, now: Instant) -> AckVerdict {
        if header.is_backoff() {
            self.sender.stop();
            let delay = self.backoff.trigger_at(now);
            return AckVerdict::Backoff { sequence, delay };
        }

        self.backoff.reset();
        if header.is_out_of_sync() {
            return AckVerdict::OutOfSync {
                sequence,
                escalation: self.escalate(),
            };
        }

        self.out_of_sync = 0;
        AckVerdict::Acknowledged { sequence }
    }

    /// Peer asked for everything unacknowledged again.
    pub fn request_resend(&mut self) {
        self.sender.wake();
    }

    fn escalate(&mut self) -> Escalation {
        self.out_of_sync += 1;
        if self.out_of_sync > self.out_of_sync_max {
            self.sender.stop();
            Escalation::FlushAndClose
        } else {
            self.sender.wake();
            Escalation::ResendUnacked
        }
    }

    /// Request a delivery run.
    pub fn wake(&mut self) {
        self.sender.wake();
    }

    /// True when a delivery tick has work to try.
    pub fn wants_send_at(&self, now: Instant) -> bool {
        self.sender.is_active() && !self.backoff.is_active_at(now)
    }

    /// Start a delivery tick.
    pub fn begin_tick(&mut self) {
        self.sender.begin_tick();
    }

    /// Next entry to write, unless the sender is idle or paused.
    pub fn next_outbound_at(
        &mut self,
        store: &dyn Store,
        destination: &PeerId,
        now: Instant,
    ) -> StoreResult<Option<QueuedMessage>> {
        if self.backoff.is_active_at(now) {
            return Ok(None);
        }
        self.sender.pull(store, destination)
    }

    /// Deadline of a running backoff pause.
    pub fn backoff_deadline(&self) -> Option<Instant> {
        self.backoff.deadline()
    }

    /// Backoff pause ran out; resume delivery.
    pub fn on_backoff_expired(&mut self) {
        self.backoff.expire();
        self.sender.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClientId;
    use crate::store::MemoryStore;

    fn config(max: u32) -> DeliveryConfig {
        DeliveryConfig {
            out_of_sync_max: max,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            sender_batch: 8,
        }
    }

    #[test]
    fn test_fresh_frame() {
        let mut engine = DeliveryEngine::new(config(5), 3);
        let verdict = engine.on_data(4);

        assert!(verdict.deliver);
        assert_eq!(verdict.ack, Header::ACK | Header::PROCESSED);
        assert_eq!(verdict.persist, Some(4));
        assert_eq!(engine.receive_sequence(), 4);
    }

    #[test]
    fn test_replay_is_not_delivered() {
        let mut engine = DeliveryEngine::new(config(5), 3);
        engine.on_data(4);

        for replay in [1, 4] {
            let verdict = engine.on_data(replay);
            assert!(!verdict.deliver);
            assert_eq!(verdict.ack, Header::ACK);
            assert!(!verdict.ack.is_processed());
            assert_eq!(verdict.persist, None);
        }
        assert_eq!(engine.receive_sequence(), 4);
    }

    #[test]
    fn test_gap_requests_resend_until_threshold() {
        let mut engine = DeliveryEngine::new(config(5), 0);

        for count in 1..=5 {
            let verdict = engine.on_data(10);
            assert_eq!(verdict.ack, Header::ACK | Header::OUT_OF_SYNC);
            assert_eq!(verdict.escalation, Escalation::ResendUnacked);
            assert_eq!(engine.out_of_sync_count(), count);
        }

        let verdict = engine.on_data(10);
        assert_eq!(verdict.escalation, Escalation::FlushAndClose);
    }

    #[test]
    fn test_fresh_frame_clears_out_of_sync() {
        let mut engine = DeliveryEngine::new(config(1), 0);
        engine.on_data(5);
        engine.on_data(1);
        assert_eq!(engine.out_of_sync_count(), 0);

        assert_eq!(engine.on_data(5).escalation, Escalation::ResendUnacked);
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut engine = DeliveryEngine::new(config(5), 0);
        let now = Instant::now();
        let d = Duration::from_millis(100);

        let delays: Vec<_> = (7..10)
            .map(|seq| match engine.on_ack_at(Header::ACK | Header::BACKOFF, seq, now) {
                AckVerdict::Backoff { sequence, delay } => {
                    assert_eq!(sequence, seq);
                    delay
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(delays, vec![d, d * 2, d * 4]);

        assert_eq!(
            engine.on_ack_at(Header::ACK | Header::PROCESSED, 9, now),
            AckVerdict::Acknowledged { sequence: 9 }
        );
        assert!(matches!(
            engine.on_ack_at(Header::ACK | Header::BACKOFF, 10, now),
            AckVerdict::Backoff { delay, .. } if delay == d
        ));
    }

    #[test]
    fn test_out_of_sync_ack_escalates() {
        let mut engine = DeliveryEngine::new(config(2), 0);
        let now = Instant::now();
        let oos = Header::ACK | Header::OUT_OF_SYNC;

        for _ in 0..2 {
            assert_eq!(
                engine.on_ack_at(oos, 4, now),
                AckVerdict::OutOfSync {
                    sequence: 4,
                    escalation: Escalation::ResendUnacked
                }
            );
        }
        assert_eq!(
            engine.on_ack_at(oos, 4, now),
            AckVerdict::OutOfSync {
                sequence: 4,
                escalation: Escalation::FlushAndClose
            }
        );
    }

    #[test]
    fn test_clean_ack_clears_out_of_sync() {
        let mut engine = DeliveryEngine::new(config(1), 0);
        let now = Instant::now();

        engine.on_ack_at(Header::ACK | Header::OUT_OF_SYNC, 2, now);
        engine.on_ack_at(Header::ACK, 2, now);
        assert_eq!(engine.out_of_sync_count(), 0);
    }

    #[test]
    fn test_sender_paused_during_backoff() {
        let store = MemoryStore::new();
        let dest = PeerId::Client(ClientId(3));
        let seq = store.enqueue(&dest, b"hello").unwrap();

        let mut engine = DeliveryEngine::new(config(5), 0);
        let now = Instant::now();
        engine.wake();
        engine.begin_tick();
        assert!(engine.wants_send_at(now));

        engine.on_ack_at(Header::ACK | Header::BACKOFF, seq, now);
        assert!(!engine.wants_send_at(now));
        engine.wake();
        assert!(
            engine
                .next_outbound_at(&store, &dest, now)
                .unwrap()
                .is_none()
        );

        let later = now + Duration::from_millis(150);
        engine.on_backoff_expired();
        assert!(engine.wants_send_at(later));
        let entry = engine.next_outbound_at(&store, &dest, later).unwrap().unwrap();
        assert_eq!(entry.sequence, seq);
        assert_eq!(entry.payload, b"hello");
    }
}
