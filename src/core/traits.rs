//! Peer identifiers and the durable store boundary.
//!
//! The gateway never owns queues, sequence counters, or credentials. All of
//! that lives behind [`Store`], which the connection handlers call
//! synchronously; an implementation is expected to serialize updates per
//! destination queue (single-row update semantics).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants::BASE_ID_SIZE;
use super::error::StoreResult;
use crate::crypto::DeviceKey;

/// 16-byte identifier of a Base device.
///
/// Rendered and parsed as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BaseId([u8; BASE_ID_SIZE]);

impl BaseId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; BASE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice of exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; BASE_ID_SIZE]>::try_from(bytes).ok().map(Self)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; BASE_ID_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BaseId({})", self.to_hex())
    }
}

/// Error parsing a [`BaseId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("base id must be {} hex characters", BASE_ID_SIZE * 2)]
pub struct ParseBaseIdError;

impl FromStr for BaseId {
    type Err = ParseBaseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; BASE_ID_SIZE];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| ParseBaseIdError)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for BaseId {
    type Error = ParseBaseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BaseId> for String {
    fn from(id: BaseId) -> Self {
        id.to_hex()
    }
}

impl AsRef<[u8]> for BaseId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Numeric identifier of an application Client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Identity of an authenticated peer from either population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerId {
    /// A Base device.
    Base(BaseId),
    /// An application Client.
    Client(ClientId),
}

impl PeerId {
    /// Returns the Base identifier, if this is a Base.
    pub fn as_base(&self) -> Option<BaseId> {
        match self {
            PeerId::Base(id) => Some(*id),
            PeerId::Client(_) => None,
        }
    }

    /// Returns the Client identifier, if this is a Client.
    pub fn as_client(&self) -> Option<ClientId> {
        match self {
            PeerId::Client(id) => Some(*id),
            PeerId::Base(_) => None,
        }
    }

    /// True for Base peers.
    pub fn is_base(&self) -> bool {
        matches!(self, PeerId::Base(_))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Base(id) => write!(f, "base-{id}"),
            PeerId::Client(id) => id.fmt(f),
        }
    }
}

impl From<BaseId> for PeerId {
    fn from(id: BaseId) -> Self {
        PeerId::Base(id)
    }
}

impl From<ClientId> for PeerId {
    fn from(id: ClientId) -> Self {
        PeerId::Client(id)
    }
}

/// Oldest unsent entry of a destination queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Server sequence assigned at enqueue time.
    pub sequence: u32,
    /// Raw data bytes as relayed.
    pub payload: Vec<u8>,
    /// More unsent entries remain after this one.
    pub more_pending: bool,
}

/// What a connecting peer presents to the credential store.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    /// Claimed Base identity from handshake phase one.
    Base(BaseId),
    /// Client login token.
    Client(&'a str),
}

impl Credential<'_> {
    /// Identity string recorded with failed attempts.
    pub fn audit_label(&self) -> String {
        match self {
            Credential::Base(id) => id.to_hex(),
            Credential::Client(_) => "client-token".to_string(),
        }
    }
}

/// Successful credential lookup.
#[derive(Clone)]
pub struct AuthGrant {
    /// Authenticated identity.
    pub peer: PeerId,
    /// Device key; present for Bases only.
    pub key: Option<DeviceKey>,
    /// Local timezone offset of the peer's installation, in minutes.
    pub timezone_offset_minutes: i16,
}

impl fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGrant")
            .field("peer", &self.peer)
            .field("has_key", &self.key.is_some())
            .field("timezone_offset_minutes", &self.timezone_offset_minutes)
            .finish()
    }
}

/// Sequencing state handed to a peer that has proven its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStart {
    /// Last sequence accepted from this peer before the connection.
    pub stored_sequence: u32,
    /// The peer's outbound queue was empty, so the server sequence was
    /// reset and the peer must reset its expectation too.
    pub force_resync: bool,
}

/// Outcome of [`Store::authenticate`].
#[derive(Debug, Clone)]
pub enum AuthDecision {
    /// Identity known and within the attempt budget.
    Granted(AuthGrant),
    /// Identity unknown, or the remote address is over budget.
    Rejected {
        /// The remote address exceeded the failed-attempt budget.
        too_many_attempts: bool,
    },
}

/// Durable queue, sequence, and credential store.
///
/// Errors are never fatal to a connection: callers log them and skip the
/// dependent response.
pub trait Store: Send + Sync + 'static {
    /// Append a payload to the destination queue, returning its server sequence.
    fn enqueue(&self, destination: &PeerId, payload: &[u8]) -> StoreResult<u32>;

    /// Oldest unsent entry for the destination. Does not mark it sent.
    fn next_unsent(&self, destination: &PeerId) -> StoreResult<Option<QueuedMessage>>;

    /// Mark an entry as written to the wire.
    fn mark_sent(&self, destination: &PeerId, sequence: u32) -> StoreResult<()>;

    /// Mark an entry for redelivery. Idempotent.
    fn mark_unsent(&self, destination: &PeerId, sequence: u32) -> StoreResult<()>;

    /// Mark every sent but unacknowledged entry for redelivery.
    fn mark_unacked_unsent(&self, destination: &PeerId) -> StoreResult<usize>;

    /// Acknowledge an entry. Returns false when the sequence is unknown.
    fn ack(&self, destination: &PeerId, sequence: u32) -> StoreResult<bool>;

    /// Drop every queued entry for the destination.
    fn flush(&self, destination: &PeerId) -> StoreResult<usize>;

    /// Last sequence accepted from the peer.
    fn load_receive_sequence(&self, peer: &PeerId) -> StoreResult<u32>;

    /// Persist the last sequence accepted from the peer.
    fn save_receive_sequence(&self, peer: &PeerId, value: u32) -> StoreResult<()>;

    /// Look up a credential, enforcing `attempt_limit` failures per `window`
    /// for the remote address.
    ///
    /// Only failures are recorded; peer state is left untouched, since a
    /// Base identity is not proven until the challenge is echoed.
    fn authenticate(
        &self,
        credential: Credential<'_>,
        remote: IpAddr,
        attempt_limit: u32,
        window: Duration,
    ) -> StoreResult<AuthDecision>;

    /// Begin a session for a proven peer: report its stored receive
    /// sequence and, when its queue is empty, restart server sequencing.
    fn open_session(&self, peer: &PeerId) -> StoreResult<SessionStart>;

    /// Record a failed attempt for rate limiting and audit.
    fn record_auth_failure(&self, identity: &str, remote: IpAddr) -> StoreResult<()>;

    /// Peers of the other population subscribed to `peer`.
    fn subscribers(&self, peer: &PeerId) -> StoreResult<Vec<PeerId>>;

    /// Persist online status.
    fn set_online(&self, peer: &PeerId, online: bool) -> StoreResult<()>;

    /// Stored device variable for a Base (empty when never set).
    fn load_variable(&self, base: &BaseId) -> StoreResult<Vec<u8>>;

    /// Replace the stored device variable for a Base.
    fn save_variable(&self, base: &BaseId, value: &[u8]) -> StoreResult<()>;
}
