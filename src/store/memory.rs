//! In-memory store for tests and development deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::core::{
    AuthDecision, AuthGrant, BaseId, ClientId, Credential, PeerId, QueuedMessage, SessionStart,
    Store, StoreError, StoreResult,
};
use crate::crypto::DeviceKey;

/// One durable queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Relayed bytes.
    pub payload: Vec<u8>,
    /// Written to the destination and awaiting its ACK.
    pub sent: bool,
}

#[derive(Debug, Default)]
struct Queue {
    last_sequence: u32,
    entries: BTreeMap<u32, QueueEntry>,
}

struct BaseRecord {
    key: DeviceKey,
    timezone_offset_minutes: i16,
    variable: Vec<u8>,
}

struct FailedAttempt {
    remote: IpAddr,
    at: Instant,
}

#[derive(Default)]
struct Inner {
    bases: HashMap<BaseId, BaseRecord>,
    tokens: HashMap<String, ClientId>,
    subscriptions: BTreeSet<(ClientId, BaseId)>,
    queues: HashMap<PeerId, Queue>,
    receive_sequences: HashMap<PeerId, u32>,
    online: HashSet<PeerId>,
    failures: Vec<FailedAttempt>,
}

impl Inner {
    fn recent_failures(&mut self, remote: IpAddr, window: Duration, now: Instant) -> usize {
        self.failures
            .retain(|attempt| now.saturating_duration_since(attempt.at) < window);
        self.failures
            .iter()
            .filter(|attempt| attempt.remote == remote)
            .count()
    }

    /// An empty queue restarts server sequencing; the peer must follow.
    fn resync_if_idle(&mut self, peer: &PeerId) -> bool {
        let queue = self.queues.entry(*peer).or_default();
        if queue.entries.is_empty() {
            queue.last_sequence = 0;
            true
        } else {
            false
        }
    }
}

/// Thread-safe in-memory [`Store`].
///
/// Acknowledged entries are deleted. Cloning shares the same state.
///
/// # Example
///
/// ```rust
/// use basegate::core::{ClientId, PeerId, Store};
/// use basegate::store::MemoryStore;
///
/// let store = MemoryStore::new();
/// let dest = PeerId::Client(ClientId(1));
/// let seq = store.enqueue(&dest, b"hello").unwrap();
/// assert_eq!(seq, 1);
/// assert!(store.ack(&dest, seq).unwrap());
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a Base and its device key.
    pub fn add_base(&self, id: BaseId, key: DeviceKey) {
        self.add_base_with_timezone(id, key, 0);
    }

    /// Register a Base with its installation timezone offset.
    pub fn add_base_with_timezone(&self, id: BaseId, key: DeviceKey, timezone_offset_minutes: i16) {
        self.inner.write().bases.insert(
            id,
            BaseRecord {
                key,
                timezone_offset_minutes,
                variable: Vec::new(),
            },
        );
    }

    /// Register a Client login token.
    pub fn add_client(&self, id: ClientId, token: impl Into<String>) {
        self.inner.write().tokens.insert(token.into(), id);
    }

    /// Subscribe a Client to a Base (both directions relay).
    pub fn subscribe(&self, client: ClientId, base: BaseId) {
        self.inner.write().subscriptions.insert((client, base));
    }

    /// Snapshot of a destination queue in sequence order.
    pub fn queue(&self, destination: &PeerId) -> Vec<(u32, QueueEntry)> {
        self.inner
            .read()
            .queues
            .get(destination)
            .map(|queue| {
                queue
                    .entries
                    .iter()
                    .map(|(seq, entry)| (*seq, entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Persisted online status.
    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.inner.read().online.contains(peer)
    }

    /// Failed attempts currently on record for `remote`.
    pub fn auth_failures(&self, remote: IpAddr) -> usize {
        self.inner
            .read()
            .failures
            .iter()
            .filter(|attempt| attempt.remote == remote)
            .count()
    }
}

impl Store for MemoryStore {
    fn enqueue(&self, destination: &PeerId, payload: &[u8]) -> StoreResult<u32> {
        let mut inner = self.inner.write();
        let queue = inner.queues.entry(*destination).or_default();
        let sequence = queue
            .last_sequence
            .checked_add(1)
            .ok_or_else(|| StoreError::Unavailable(format!("sequence space exhausted for {destination}")))?;
        queue.last_sequence = sequence;
        queue.entries.insert(
            sequence,
            QueueEntry {
                payload: payload.to_vec(),
                sent: false,
            },
        );
        Ok(sequence)
    }

    fn next_unsent(&self, destination: &PeerId) -> StoreResult<Option<QueuedMessage>> {
        let inner = self.inner.read();
        let Some(queue) = inner.queues.get(destination) else {
            return Ok(None);
        };

        let mut unsent = queue.entries.iter().filter(|(_, entry)| !entry.sent);
        Ok(unsent.next().map(|(sequence, entry)| QueuedMessage {
            sequence: *sequence,
            payload: entry.payload.clone(),
            more_pending: unsent.next().is_some(),
        }))
    }

    fn mark_sent(&self, destination: &PeerId, sequence: u32) -> StoreResult<()> {
        if let Some(entry) = self
            .inner
            .write()
            .queues
            .get_mut(destination)
            .and_then(|queue| queue.entries.get_mut(&sequence))
        {
            entry.sent = true;
        }
        Ok(())
    }

    fn mark_unsent(&self, destination: &PeerId, sequence: u32) -> StoreResult<()> {
        if let Some(entry) = self
            .inner
            .write()
            .queues
            .get_mut(destination)
            .and_then(|queue| queue.entries.get_mut(&sequence))
        {
            entry.sent = false;
        }
        Ok(())
    }

    fn mark_unacked_unsent(&self, destination: &PeerId) -> StoreResult<usize> {
        let mut inner = self.inner.write();
        let Some(queue) = inner.queues.get_mut(destination) else {
            return Ok(0);
        };

        let mut count = 0;
        for entry in queue.entries.values_mut().filter(|entry| entry.sent) {
            entry.sent = false;
            count += 1;
        }
        Ok(count)
    }

    fn ack(&self, destination: &PeerId, sequence: u32) -> StoreResult<bool> {
        Ok(self
            .inner
            .write()
            .queues
            .get_mut(destination)
            .and_then(|queue| queue.entries.remove(&sequence))
            .is_some())
    }

    fn flush(&self, destination: &PeerId) -> StoreResult<usize> {
        let mut inner = self.inner.write();
        Ok(inner
            .queues
            .get_mut(destination)
            .map(|queue| {
                let dropped = queue.entries.len();
                queue.entries.clear();
                dropped
            })
            .unwrap_or(0))
    }

    fn load_receive_sequence(&self, peer: &PeerId) -> StoreResult<u32> {
        Ok(self
            .inner
            .read()
            .receive_sequences
            .get(peer)
            .copied()
            .unwrap_or(0))
    }

    fn save_receive_sequence(&self, peer: &PeerId, value: u32) -> StoreResult<()> {
        self.inner.write().receive_sequences.insert(*peer, value);
        Ok(())
    }

    fn authenticate(
        &self,
        credential: Credential<'_>,
        remote: IpAddr,
        attempt_limit: u32,
        window: Duration,
    ) -> StoreResult<AuthDecision> {
        let now = Instant::now();
        let mut inner = self.inner.write();

        if inner.recent_failures(remote, window, now) >= attempt_limit as usize {
            return Ok(AuthDecision::Rejected {
                too_many_attempts: true,
            });
        }

        let found = match credential {
            Credential::Base(id) => inner.bases.get(&id).map(|record| {
                (
                    PeerId::Base(id),
                    Some(record.key.clone()),
                    record.timezone_offset_minutes,
                )
            }),
            Credential::Client(token) => inner
                .tokens
                .get(token)
                .map(|id| (PeerId::Client(*id), None, 0)),
        };

        let Some((peer, key, timezone_offset_minutes)) = found else {
            inner.failures.push(FailedAttempt { remote, at: now });
            return Ok(AuthDecision::Rejected {
                too_many_attempts: false,
            });
        };

        Ok(AuthDecision::Granted(AuthGrant {
            peer,
            key,
            timezone_offset_minutes,
        }))
    }

    fn open_session(&self, peer: &PeerId) -> StoreResult<SessionStart> {
        let mut inner = self.inner.write();
        let stored_sequence = inner.receive_sequences.get(peer).copied().unwrap_or(0);
        let force_resync = inner.resync_if_idle(peer);
        Ok(SessionStart {
            stored_sequence,
            force_resync,
        })
    }

    fn record_auth_failure(&self, _identity: &str, remote: IpAddr) -> StoreResult<()> {
        self.inner.write().failures.push(FailedAttempt {
            remote,
            at: Instant::now(),
        });
        Ok(())
    }

    fn subscribers(&self, peer: &PeerId) -> StoreResult<Vec<PeerId>> {
        let inner = self.inner.read();
        let peers = match peer {
            PeerId::Base(base) => inner
                .subscriptions
                .iter()
                .filter(|(_, b)| b == base)
                .map(|(client, _)| PeerId::Client(*client))
                .collect(),
            PeerId::Client(client) => inner
                .subscriptions
                .iter()
                .filter(|(c, _)| c == client)
                .map(|(_, base)| PeerId::Base(*base))
                .collect(),
        };
        Ok(peers)
    }

    fn set_online(&self, peer: &PeerId, online: bool) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if online {
            inner.online.insert(*peer);
        } else {
            inner.online.remove(peer);
        }
        Ok(())
    }

    fn load_variable(&self, base: &BaseId) -> StoreResult<Vec<u8>> {
        self.inner
            .read()
            .bases
            .get(base)
            .map(|record| record.variable.clone())
            .ok_or_else(|| StoreError::UnknownPeer(base.to_hex()))
    }

    fn save_variable(&self, base: &BaseId, value: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let record = inner
            .bases
            .get_mut(base)
            .ok_or_else(|| StoreError::UnknownPeer(base.to_hex()))?;
        record.variable = value.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));
    const WINDOW: Duration = Duration::from_secs(300);

    fn base() -> BaseId {
        BaseId::from_bytes([0xb1; 16])
    }

    fn client() -> PeerId {
        PeerId::Client(ClientId(9))
    }

    #[test]
    fn test_enqueue_assigns_monotonic_sequences() {
        let store = MemoryStore::new();
        let dest = client();

        assert_eq!(store.enqueue(&dest, b"a").unwrap(), 1);
        assert_eq!(store.enqueue(&dest, b"b").unwrap(), 2);
        assert_eq!(store.enqueue(&PeerId::Base(base()), b"c").unwrap(), 1);
    }

    #[test]
    fn test_next_unsent_order_and_more_pending() {
        let store = MemoryStore::new();
        let dest = client();
        store.enqueue(&dest, b"a").unwrap();
        store.enqueue(&dest, b"b").unwrap();

        let first = store.next_unsent(&dest).unwrap().unwrap();
        assert_eq!((first.sequence, first.more_pending), (1, true));

        store.mark_sent(&dest, 1).unwrap();
        let second = store.next_unsent(&dest).unwrap().unwrap();
        assert_eq!((second.sequence, second.more_pending), (2, false));

        store.mark_sent(&dest, 2).unwrap();
        assert!(store.next_unsent(&dest).unwrap().is_none());
    }

    #[test]
    fn test_mark_unsent_is_idempotent() {
        let store = MemoryStore::new();
        let dest = client();
        let seq = store.enqueue(&dest, b"a").unwrap();
        store.mark_sent(&dest, seq).unwrap();

        store.mark_unsent(&dest, seq).unwrap();
        store.mark_unsent(&dest, seq).unwrap();
        store.mark_unsent(&dest, 999).unwrap();
        assert_eq!(store.next_unsent(&dest).unwrap().unwrap().sequence, seq);
    }

    #[test]
    fn test_mark_unacked_unsent() {
        let store = MemoryStore::new();
        let dest = client();
        for payload in [b"a", b"b", b"c"] {
            let seq = store.enqueue(&dest, payload).unwrap();
            store.mark_sent(&dest, seq).unwrap();
        }
        store.ack(&dest, 2).unwrap();

        assert_eq!(store.mark_unacked_unsent(&dest).unwrap(), 2);
        let sequences: Vec<_> = store.queue(&dest).into_iter().map(|(s, _)| s).collect();
        assert_eq!(sequences, vec![1, 3]);
        assert!(store.queue(&dest).iter().all(|(_, entry)| !entry.sent));
    }

    #[test]
    fn test_ack_and_flush() {
        let store = MemoryStore::new();
        let dest = client();
        let seq = store.enqueue(&dest, b"a").unwrap();
        store.enqueue(&dest, b"b").unwrap();

        assert!(store.ack(&dest, seq).unwrap());
        assert!(!store.ack(&dest, seq).unwrap());
        assert_eq!(store.flush(&dest).unwrap(), 1);
        assert!(store.queue(&dest).is_empty());
    }

    #[test]
    fn test_receive_sequence_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.load_receive_sequence(&client()).unwrap(), 0);

        store.save_receive_sequence(&client(), 44).unwrap();
        assert_eq!(store.load_receive_sequence(&client()).unwrap(), 44);
    }

    #[test]
    fn test_authenticate_base_with_pending_queue() {
        let store = MemoryStore::new();
        store.add_base_with_timezone(base(), DeviceKey::from_bytes([1; 16]), 120);
        let peer = PeerId::Base(base());
        store.save_receive_sequence(&peer, 6).unwrap();
        store.enqueue(&peer, b"queued").unwrap();

        let AuthDecision::Granted(grant) = store
            .authenticate(Credential::Base(base()), REMOTE, 5, WINDOW)
            .unwrap()
        else {
            panic!("expected grant");
        };
        assert_eq!(grant.peer, peer);
        assert_eq!(grant.timezone_offset_minutes, 120);
        assert_eq!(grant.key, Some(DeviceKey::from_bytes([1; 16])));

        let start = store.open_session(&peer).unwrap();
        assert_eq!(start.stored_sequence, 6);
        assert!(!start.force_resync);
    }

    #[test]
    fn test_lookup_leaves_idle_queue_alone() {
        let store = MemoryStore::new();
        store.add_base(base(), DeviceKey::from_bytes([1; 16]));
        let peer = PeerId::Base(base());
        store.enqueue(&peer, b"x").unwrap();
        store.ack(&peer, 1).unwrap();

        for _ in 0..3 {
            store
                .authenticate(Credential::Base(base()), REMOTE, 5, WINDOW)
                .unwrap();
        }
        assert_eq!(store.enqueue(&peer, b"y").unwrap(), 2);
    }

    #[test]
    fn test_idle_queue_forces_resync() {
        let store = MemoryStore::new();
        store.add_client(ClientId(9), "tok");
        store.enqueue(&client(), b"x").unwrap();
        store.ack(&client(), 1).unwrap();

        let AuthDecision::Granted(grant) = store
            .authenticate(Credential::Client("tok"), REMOTE, 5, WINDOW)
            .unwrap()
        else {
            panic!("expected grant");
        };
        assert!(grant.key.is_none());
        assert!(store.open_session(&grant.peer).unwrap().force_resync);
        assert_eq!(store.enqueue(&client(), b"y").unwrap(), 1);
    }

    #[test]
    fn test_unknown_credential_counts_toward_limit() {
        let store = MemoryStore::new();
        store.add_client(ClientId(9), "tok");

        for _ in 0..2 {
            assert!(matches!(
                store
                    .authenticate(Credential::Client("nope"), REMOTE, 2, WINDOW)
                    .unwrap(),
                AuthDecision::Rejected {
                    too_many_attempts: false
                }
            ));
        }
        assert!(matches!(
            store
                .authenticate(Credential::Client("tok"), REMOTE, 2, WINDOW)
                .unwrap(),
            AuthDecision::Rejected {
                too_many_attempts: true
            }
        ));

        // Another address is unaffected.
        let other = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 3));
        assert!(matches!(
            store
                .authenticate(Credential::Client("tok"), other, 2, WINDOW)
                .unwrap(),
            AuthDecision::Granted(_)
        ));
    }

    #[test]
    fn test_failures_expire_with_window() {
        let store = MemoryStore::new();
        store.add_client(ClientId(9), "tok");
        store.record_auth_failure("x", REMOTE).unwrap();

        assert!(matches!(
            store
                .authenticate(Credential::Client("tok"), REMOTE, 1, Duration::ZERO)
                .unwrap(),
            AuthDecision::Granted(_)
        ));
        assert_eq!(store.auth_failures(REMOTE), 0);
    }

    #[test]
    fn test_subscribers_both_directions() {
        let store = MemoryStore::new();
        let other = BaseId::from_bytes([0xb2; 16]);
        store.subscribe(ClientId(9), base());
        store.subscribe(ClientId(9), other);
        store.subscribe(ClientId(10), base());

        let clients = store.subscribers(&PeerId::Base(base())).unwrap();
        assert_eq!(
            clients,
            vec![PeerId::Client(ClientId(9)), PeerId::Client(ClientId(10))]
        );
        assert_eq!(store.subscribers(&client()).unwrap().len(), 2);
    }

    #[test]
    fn test_online_and_variable() {
        let store = MemoryStore::new();
        store.add_base(base(), DeviceKey::generate());
        let peer = PeerId::Base(base());

        store.set_online(&peer, true).unwrap();
        assert!(store.is_online(&peer));
        store.set_online(&peer, false).unwrap();
        assert!(!store.is_online(&peer));

        assert!(store.load_variable(&base()).unwrap().is_empty());
        store.save_variable(&base(), b"cfg").unwrap();
        assert_eq!(store.load_variable(&base()).unwrap(), b"cfg");
        assert!(matches!(
            store.load_variable(&BaseId::from_bytes([0; 16])),
            Err(StoreError::UnknownPeer(_))
        ));
    }
}
