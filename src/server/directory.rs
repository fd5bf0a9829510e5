//! Live connection directory.
//!
//! Maps an authenticated peer to the command channel of the task serving
//! it. Relay logic on other connections only ever talks to a session
//! through this channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Notify, mpsc};
use tracing::warn;

use crate::core::PeerId;
use crate::transport::{ClientMessage, Message};

/// Best-effort write handed to a live connection.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Frame for a Base, encrypted under its session key on the way out.
    Frame(Message),
    /// Line for a Client.
    Line(ClientMessage),
}

/// Instruction to a connection task.
#[derive(Debug, Clone)]
pub enum Command {
    /// New queue entries; run the delivery loop now.
    Wake,
    /// Write without queueing.
    Deliver(Outgoing),
    /// A newer connection authenticated as the same peer.
    Evict,
}

#[derive(Debug, Default)]
struct Signals {
    wake: AtomicBool,
    evict: AtomicBool,
    notify: Notify,
}

/// Sending side of a connection task's commands.
///
/// `Wake` and `Evict` are flags, so repeats collapse into one pending
/// command. Deliveries go through a bounded buffer and are dropped when a
/// slow peer lets it fill up.
#[derive(Debug, Clone)]
pub struct CommandSender {
    outgoing: mpsc::Sender<Outgoing>,
    signals: Arc<Signals>,
}

/// Receiving side, owned by the connection task.
#[derive(Debug)]
pub struct CommandReceiver {
    outgoing: mpsc::Receiver<Outgoing>,
    signals: Arc<Signals>,
}

/// Command channel buffering up to `capacity` deliveries.
pub fn command_channel(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let signals = Arc::new(Signals::default());
    (
        CommandSender {
            outgoing: tx,
            signals: signals.clone(),
        },
        CommandReceiver {
            outgoing: rx,
            signals,
        },
    )
}

impl CommandSender {
    /// Hand `command` to the task. False when the task is gone or its
    /// delivery buffer is full.
    pub fn send(&self, command: Command) -> bool {
        if self.outgoing.is_closed() {
            return false;
        }
        let flag = match command {
            Command::Wake => &self.signals.wake,
            Command::Evict => &self.signals.evict,
            Command::Deliver(outgoing) => {
                return match self.outgoing.try_send(outgoing) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!("command buffer full, dropping delivery");
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                };
            }
        };
        flag.store(true, Ordering::Release);
        self.signals.notify.notify_one();
        true
    }
}

impl CommandReceiver {
    /// Next pending command, evictions first. Cancel safe.
    ///
    /// `None` once every sender is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Command> {
        loop {
            if let Ok(command) = self.try_recv() {
                return Some(command);
            }
            tokio::select! {
                biased;
                _ = self.signals.notify.notified() => {}
                outgoing = self.outgoing.recv() => return outgoing.map(Command::Deliver),
            }
        }
    }

    /// Pending command without waiting.
    pub fn try_recv(&mut self) -> Result<Command, TryRecvError> {
        if self.signals.evict.swap(false, Ordering::AcqRel) {
            return Ok(Command::Evict);
        }
        if self.signals.wake.swap(false, Ordering::AcqRel) {
            return Ok(Command::Wake);
        }
        self.outgoing.try_recv().map(Command::Deliver)
    }
}

#[derive(Debug)]
struct Entry {
    connection: u64,
    tx: CommandSender,
}

/// Thread-safe peer → connection map.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<PeerId, Entry>>,
    next_connection: AtomicU64,
}

impl PeerDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a new connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make `connection` the live session of `peer`.
    ///
    /// Returns true when an older session was displaced; it receives
    /// [`Command::Evict`].
    pub fn register(&self, peer: PeerId, connection: u64, tx: CommandSender) -> bool {
        let previous = self.peers.write().insert(peer, Entry { connection, tx });
        match previous {
            Some(old) if old.connection != connection => {
                old.tx.send(Command::Evict);
                true
            }
            _ => false,
        }
    }

    /// Drop `peer` if `connection` is still its live session.
    ///
    /// A displaced session must not unregister its successor.
    pub fn remove(&self, peer: &PeerId, connection: u64) -> bool {
        let mut peers = self.peers.write();
        match peers.get(peer) {
            Some(entry) if entry.connection == connection => {
                peers.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// Send a command to the live session of `peer`.
    ///
    /// False when the peer is offline or its task is gone.
    pub fn send(&self, peer: &PeerId, command: Command) -> bool {
        self.peers
            .read()
            .get(peer)
            .is_some_and(|entry| entry.tx.send(command))
    }

    /// Whether `peer` has a live session.
    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
