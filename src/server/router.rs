//! Relay between the two populations.
//!
//! Sequenced payloads go through the destination's durable queue and the
//! destination's task is woken if it is live. Notifications skip the queue
//! and reach live destinations only.
//!
//! Queue entries for a Client carry the originating Base id in front of the
//! payload, since the Client line names its source:
//!
//! ```text
//! +----------------+-----------------+
//! | origin (16 B)  | payload         |
//! +----------------+-----------------+
//! ```

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::directory::{Command, Outgoing, PeerDirectory};
#[cfg(test)]
use super::directory::command_channel;
use crate::core::{BASE_ID_SIZE, BaseId, ClientId, PeerId, Store, StoreResult};
use crate::transport::{ClientMessage, Header, Message};

/// Queue entry for a Client destination.
pub fn client_entry(origin: BaseId, payload: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(BASE_ID_SIZE + payload.len());
    entry.extend_from_slice(origin.as_bytes());
    entry.extend_from_slice(payload);
    entry
}

/// Split a Client queue entry into origin and payload.
pub fn split_client_entry(entry: &[u8]) -> Option<(BaseId, &[u8])> {
    let origin = BaseId::from_slice(entry.get(..BASE_ID_SIZE)?)?;
    Some((origin, &entry[BASE_ID_SIZE..]))
}

/// Fan-out from one peer to its subscribers.
#[derive(Clone)]
pub struct Router {
    store: Arc<dyn Store>,
    directory: Arc<PeerDirectory>,
}

impl Router {
    /// Create over a store and a directory.
    pub fn new(store: Arc<dyn Store>, directory: Arc<PeerDirectory>) -> Self {
        Self { store, directory }
    }

    /// Shared store.
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Shared directory.
    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// Relay a fresh Base payload to every subscribed Client.
    ///
    /// Returns the number of destinations queued or reached.
    pub fn relay_from_base(
        &self,
        origin: BaseId,
        header: Header,
        payload: &[u8],
    ) -> StoreResult<usize> {
        let destinations = self.store.subscribers(&PeerId::Base(origin))?;

        let reached = if header.is_notification() {
            let mut line = ClientMessage::from_base(0, origin, payload);
            line.header = Header::NOTIFICATION.into();
            self.notify(&destinations, &Outgoing::Line(line))
        } else {
            let entry = client_entry(origin, payload);
            self.enqueue(&destinations, &entry)
        };
        debug!(%origin, reached, total = destinations.len(), "relayed base payload");
        Ok(reached)
    }

    /// Relay a fresh Client payload to its subscribed Bases.
    ///
    /// `targets` narrows the fan-out to the named Bases; empty means all.
    pub fn relay_from_client(
        &self,
        origin: ClientId,
        header: Header,
        targets: &[String],
        payload: &[u8],
    ) -> StoreResult<usize> {
        let subscribed = self.store.subscribers(&PeerId::Client(origin))?;
        let destinations = if targets.is_empty() {
            subscribed
        } else {
            narrow(origin, &subscribed, targets)
        };

        let reached = if header.is_notification() {
            let frame = Message::new(Header::NOTIFICATION, 0, payload.to_vec());
            self.notify(&destinations, &Outgoing::Frame(frame))
        } else {
            self.enqueue(&destinations, payload)
        };
        debug!(%origin, reached, total = destinations.len(), "relayed client payload");
        Ok(reached)
    }

    /// Persist a Base's presence and tell its live Clients.
    pub fn announce_base(&self, base: BaseId, connected: bool) {
        let peer = PeerId::Base(base);
        if let Err(err) = self.store.set_online(&peer, connected) {
            warn!(%base, %err, "could not persist presence");
        }
        match self.store.subscribers(&peer) {
            Ok(clients) => {
                let status = Outgoing::Line(ClientMessage::base_status(base, connected));
                self.notify(&clients, &status);
            }
            Err(err) => warn!(%base, %err, "could not look up subscribers"),
        }
    }

    /// Presence of every Base a Client is subscribed to.
    pub fn base_statuses(&self, client: ClientId) -> StoreResult<Vec<ClientMessage>> {
        let bases = self.store.subscribers(&PeerId::Client(client))?;
        Ok(bases
            .iter()
            .filter_map(PeerId::as_base)
            .map(|base| {
                let online = self.directory.is_online(&PeerId::Base(base));
                ClientMessage::base_status(base, online)
            })
            .collect())
    }

    fn enqueue(&self, destinations: &[PeerId], payload: &[u8]) -> usize {
        let mut queued = 0;
        for destination in destinations {
            match self.store.enqueue(destination, payload) {
                Ok(sequence) => {
                    trace!(%destination, sequence, "queued");
                    self.directory.send(destination, Command::Wake);
                    queued += 1;
                }
                Err(err) => warn!(%destination, %err, "could not queue payload"),
            }
        }
        queued
    }

    fn notify(&self, destinations: &[PeerId], outgoing: &Outgoing) -> usize {
        destinations
            .iter()
            .filter(|destination| {
                let sent = self
                    .directory
                    .send(destination, Command::Deliver(outgoing.clone()));
                if !sent {
                    trace!(%destination, "notification not delivered");
                }
                sent
            })
            .count()
    }
}

fn narrow(origin: ClientId, subscribed: &[PeerId], targets: &[String]) -> Vec<PeerId> {
    let mut destinations = Vec::with_capacity(targets.len());
    for target in targets {
        let Ok(base) = target.parse::<BaseId>() else {
            warn!(%origin, requested = %target, "ignoring malformed base id");
            continue;
        };
        let peer = PeerId::Base(base);
        if subscribed.contains(&peer) {
            if !destinations.contains(&peer) {
                destinations.push(peer);
            }
        } else {
            warn!(%origin, %base, "target base is not subscribed");
        }
    }
    destinations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DeviceKey;
    use crate::store::MemoryStore;

    struct Fixture {
        store: MemoryStore,
        directory: Arc<PeerDirectory>,
        router: Router,
        bases: [BaseId; 2],
        client: ClientId,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let bases = [BaseId::from_bytes([1; 16]), BaseId::from_bytes([2; 16])];
        let client = ClientId(7);
        for base in bases {
            store.add_base(base, DeviceKey::from_bytes([9; 16]));
            store.subscribe(client, base);
        }
        store.add_client(client, "token");

        let directory = Arc::new(PeerDirectory::new());
        let router = Router::new(Arc::new(store.clone()), directory.clone());
        Fixture {
            store,
            directory,
            router,
            bases,
            client,
        }
    }

    #[test]
    fn test_client_entry_layout() {
        let origin = BaseId::from_bytes([0xab; 16]);
        let entry = client_entry(origin, b"xyz");

        assert_eq!(entry.len(), 19);
        assert_eq!(split_client_entry(&entry), Some((origin, &b"xyz"[..])));
        assert_eq!(split_client_entry(&entry[..10]), None);
    }

    #[test]
    fn test_base_payload_queued_for_subscribers() {
        let fx = fixture();
        let (tx, mut rx) = command_channel(8);
        fx.directory.register(PeerId::Client(fx.client), 1, tx);

        let reached = fx
            .router
            .relay_from_base(fx.bases[0], Header::NONE, b"hi")
            .unwrap();

        assert_eq!(reached, 1);
        let queue = fx.store.queue(&PeerId::Client(fx.client));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].1.payload, client_entry(fx.bases[0], b"hi"));
        assert!(matches!(rx.try_recv(), Ok(Command::Wake)));
    }

    #[test]
    fn test_offline_destination_still_queued() {
        let fx = fixture();
        fx.router
            .relay_from_client(fx.client, Header::NONE, &[], b"cmd")
            .unwrap();

        for base in fx.bases {
            assert_eq!(fx.store.queue(&PeerId::Base(base)).len(), 1);
        }
    }

    #[test]
    fn test_targeted_relay() {
        let fx = fixture();
        let unknown = BaseId::from_bytes([0x55; 16]);
        let targets = vec![fx.bases[1].to_hex(), unknown.to_hex(), "zz".to_string()];

        let reached = fx
            .router
            .relay_from_client(fx.client, Header::NONE, &targets, b"cmd")
            .unwrap();

        assert_eq!(reached, 1);
        assert!(fx.store.queue(&PeerId::Base(fx.bases[0])).is_empty());
        assert_eq!(fx.store.queue(&PeerId::Base(fx.bases[1])).len(), 1);
        assert!(fx.store.queue(&PeerId::Base(unknown)).is_empty());
    }

    #[test]
    fn test_notification_bypasses_queue() {
        let fx = fixture();
        let (tx, mut rx) = command_channel(8);
        fx.directory.register(PeerId::Base(fx.bases[0]), 1, tx);

        let reached = fx
            .router
            .relay_from_client(fx.client, Header::NOTIFICATION, &[], b"ping")
            .unwrap();

        assert_eq!(reached, 1);
        for base in fx.bases {
            assert!(fx.store.queue(&PeerId::Base(base)).is_empty());
        }
        match rx.try_recv() {
            Ok(Command::Deliver(Outgoing::Frame(frame))) => {
                assert!(frame.header.is_notification());
                assert_eq!(frame.data, b"ping");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_presence_announced_to_live_clients() {
        let fx = fixture();
        let (tx, mut rx) = command_channel(8);
        fx.directory.register(PeerId::Client(fx.client), 1, tx);

        fx.router.announce_base(fx.bases[0], true);

        assert!(fx.store.is_online(&PeerId::Base(fx.bases[0])));
        match rx.try_recv() {
            Ok(Command::Deliver(Outgoing::Line(line))) => {
                assert_eq!(line.data_type(), Some("base_connection_status"));
                assert_eq!(line.data["connected"], true);
                assert_eq!(line.data["baseid"], fx.bases[0].to_hex());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_base_statuses_for_login() {
        let fx = fixture();
        let (tx, _rx) = command_channel(8);
        fx.directory.register(PeerId::Base(fx.bases[1]), 1, tx);

        let statuses = fx.router.base_statuses(fx.client).unwrap();
        assert_eq!(statuses.len(), 2);
        let online: Vec<bool> = statuses
            .iter()
            .map(|s| s.data["connected"].as_bool().unwrap())
            .collect();
        assert_eq!(online.iter().filter(|&&o| o).count(), 1);
    }
}
