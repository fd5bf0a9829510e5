//! Authenticated session state shared by both connection handlers.
//!
//! Applies [`DeliveryEngine`] verdicts to the store. Store failures are
//! logged and the dependent step is skipped; they never close the session.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use super::config::PopulationConfig;
use super::router::Router;
use crate::core::{PeerId, QueuedMessage, Store};
use crate::sync::{AckVerdict, DeliveryConfig, DeliveryEngine, Escalation, SequenceCheck};
use crate::transport::Header;

/// What a connection task shares with the rest of the gateway.
pub struct Context {
    /// Population settings.
    pub config: PopulationConfig,
    /// Durable store.
    pub store: Arc<dyn Store>,
    /// Relay to the other population.
    pub router: Router,
}

/// Whether the connection should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep serving.
    Continue,
    /// Close the connection.
    Close,
}

/// What the handler does with one inbound frame or line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Acknowledgment of one of our entries, already applied.
    Ack(Flow),
    /// Unsequenced; process without acknowledging.
    Notification,
    /// Sequenced; answer with `ack`, then process the payload if `deliver`.
    Sequenced {
        /// ACK header to send back.
        ack: Header,
        /// Payload is fresh.
        deliver: bool,
        /// Close after answering.
        flow: Flow,
    },
}

/// Delivery state of one authenticated connection.
pub struct Session {
    peer: PeerId,
    connection: u64,
    engine: DeliveryEngine,
    store: Arc<dyn Store>,
    keepalive: bool,
}

impl Session {
    /// Start with the receive baseline chosen at authentication.
    pub fn new(
        peer: PeerId,
        connection: u64,
        config: DeliveryConfig,
        baseline: u32,
        store: Arc<dyn Store>,
    ) -> Self {
        let mut engine = DeliveryEngine::new(config, baseline);
        engine.wake();
        Self {
            peer,
            connection,
            engine,
            store,
            keepalive: false,
        }
    }

    /// Authenticated identity.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Directory id of the connection.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// Keep-alive probes enabled.
    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    /// Turn keep-alive probes on or off.
    pub fn set_keepalive(&mut self, enabled: bool) {
        self.keepalive = enabled;
    }

    /// Delivery engine.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Classify and apply one inbound message.
    pub fn inbound(&mut self, header: Header, sequence: u32) -> Inbound {
        if header.is_ack() {
            return Inbound::Ack(self.on_ack(header, sequence));
        }
        if header.is_notification() {
            return Inbound::Notification;
        }

        let verdict = self.engine.on_data(sequence);
        if let Some(sequence) = verdict.persist {
            self.persist(sequence);
        }
        match verdict.check {
            SequenceCheck::Fresh => trace!(peer = %self.peer, sequence, "accepted"),
            SequenceCheck::Duplicate { current, .. } => {
                warn!(peer = %self.peer, sequence, current, "duplicate, not relayed");
            }
            SequenceCheck::Gap { expected, .. } => {
                warn!(peer = %self.peer, sequence, expected, "sequence gap");
            }
        }

        Inbound::Sequenced {
            ack: verdict.ack,
            deliver: verdict.deliver,
            flow: self.escalate(verdict.escalation),
        }
    }

    fn on_ack(&mut self, header: Header, sequence: u32) -> Flow {
        match self.engine.on_ack_at(header, sequence, Instant::now()) {
            AckVerdict::Acknowledged { sequence } => {
                match self.store.ack(&self.peer, sequence) {
                    Ok(true) => trace!(peer = %self.peer, sequence, "acknowledged"),
                    Ok(false) => debug!(peer = %self.peer, sequence, "ack for unknown entry"),
                    Err(err) => warn!(peer = %self.peer, sequence, %err, "could not store ack"),
                }
                Flow::Continue
            }
            AckVerdict::OutOfSync {
                sequence,
                escalation,
            } => {
                warn!(peer = %self.peer, sequence, "peer reports out of sync");
                self.escalate(escalation)
            }
            AckVerdict::Backoff { sequence, delay } => {
                warn!(peer = %self.peer, sequence, ?delay, "peer requested backoff");
                if let Err(err) = self.store.mark_unsent(&self.peer, sequence) {
                    warn!(peer = %self.peer, sequence, %err, "could not requeue entry");
                }
                Flow::Continue
            }
        }
    }

    fn escalate(&mut self, escalation: Escalation) -> Flow {
        match escalation {
            Escalation::None => Flow::Continue,
            Escalation::ResendUnacked => {
                self.resend_unacked();
                Flow::Continue
            }
            Escalation::FlushAndClose => {
                match self.store.flush(&self.peer) {
                    Ok(dropped) => error!(
                        peer = %self.peer,
                        dropped,
                        count = self.engine.out_of_sync_count(),
                        "persistently out of sync, queue flushed"
                    ),
                    Err(err) => error!(peer = %self.peer, %err, "out of sync, flush failed"),
                }
                Flow::Close
            }
        }
    }

    /// Mark every unacknowledged entry unsent and restart delivery.
    pub fn resend_unacked(&mut self) {
        match self.store.mark_unacked_unsent(&self.peer) {
            Ok(count) => debug!(peer = %self.peer, count, "resending unacked entries"),
            Err(err) => warn!(peer = %self.peer, %err, "could not requeue unacked entries"),
        }
        self.engine.request_resend();
    }

    /// Persist the current receive sequence.
    pub fn save_receive_sequence(&self) {
        self.persist(self.engine.receive_sequence());
    }

    fn persist(&self, sequence: u32) {
        if let Err(err) = self.store.save_receive_sequence(&self.peer, sequence) {
            warn!(peer = %self.peer, sequence, %err, "could not persist receive sequence");
        }
    }

    /// Request a delivery run.
    pub fn wake(&mut self) {
        self.engine.wake();
    }

    /// True when a delivery run has work to try at `now`.
    pub fn wants_send_at(&self, now: Instant) -> bool {
        self.engine.wants_send_at(now)
    }

    /// Start a delivery run.
    pub fn begin_tick(&mut self) {
        self.engine.begin_tick();
    }

    /// Next entry of the current run, if any.
    pub fn next_outbound(&mut self, now: Instant) -> Option<QueuedMessage> {
        match self.engine.next_outbound_at(self.store.as_ref(), &self.peer, now) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(peer = %self.peer, %err, "could not read queue");
                None
            }
        }
    }

    /// Entry was written to the socket.
    pub fn mark_sent(&self, sequence: u32) {
        if let Err(err) = self.store.mark_sent(&self.peer, sequence) {
            warn!(peer = %self.peer, sequence, %err, "could not mark entry sent");
        }
    }

    /// Entry can never be written; drop it from the queue.
    pub fn discard(&self, sequence: u32) {
        if let Err(err) = self.store.ack(&self.peer, sequence) {
            warn!(peer = %self.peer, sequence, %err, "could not discard entry");
        }
    }

    /// Deadline of a running backoff pause.
    pub fn backoff_deadline(&self) -> Option<Instant> {
        self.engine.backoff_deadline()
    }

    /// Backoff pause ran out.
    pub fn on_backoff_expired(&mut self) {
        debug!(peer = %self.peer, "backoff expired, resuming delivery");
        self.engine.on_backoff_expired();
    }
}
