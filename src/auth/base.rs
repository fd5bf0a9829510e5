//! Two-phase Base handshake.
//!
//! Phase one arrives under the zero key and names the device (optionally
//! with a proof encrypted under the device key). The reply switches the
//! session to the device key and carries a fresh challenge. Phase two must
//! echo that challenge at offset 16.

use std::net::IpAddr;

use subtle::ConstantTimeEq;
use tracing::warn;

use super::{AuthPhase, AuthPolicy};
use crate::core::{
    AUTH_OK, AuthDecision, AuthError, AuthGrant, BASE_ID_SIZE, BaseId, CHALLENGE_RESPONSE_OFFSET,
    CHALLENGE_RESPONSE_SIZE, Credential, IDENTITY_PROOF_SIZE, SessionStart, Store, StoreError,
};
use crate::crypto::{BlockCipher, Challenge, DeviceKey};
use crate::transport::{Header, Message};

/// Header of every handshake reply.
fn reply_header() -> Header {
    Header::SYSTEM_MESSAGE | Header::NOTIFICATION
}

/// Successful handshake step.
#[derive(Debug)]
pub enum BaseStep {
    /// Identity accepted. Switch the session to `key`, then send `reply`.
    Challenge {
        /// Device key for the rest of the session.
        key: DeviceKey,
        /// Challenge frame.
        reply: Message,
    },
    /// Challenge echoed. Send `reply` under the device key.
    Authenticated {
        /// Store grant for the device.
        grant: AuthGrant,
        /// Sequencing state opened after the echo was verified.
        session: SessionStart,
        /// Receive-sequence baseline for the session.
        baseline: u32,
        /// Success frame.
        reply: Message,
    },
}

struct PendingChallenge {
    identity: BaseId,
    grant: AuthGrant,
    challenge: Challenge,
}

/// Per-connection Base authenticator.
pub struct BaseAuthenticator {
    phase: AuthPhase,
    remote: IpAddr,
    policy: AuthPolicy,
    pending: Option<PendingChallenge>,
    identity: Option<BaseId>,
}

impl BaseAuthenticator {
    /// Start in `AwaitingIdentity`.
    pub fn new(remote: IpAddr, policy: AuthPolicy) -> Self {
        Self {
            phase: AuthPhase::AwaitingIdentity,
            remote,
            policy,
            pending: None,
            identity: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Claimed (and, once authenticated, proven) identity.
    pub fn identity(&self) -> Option<BaseId> {
        self.identity
    }

    /// Feed one decrypted frame.
    pub fn handle(&mut self, message: &Message, store: &dyn Store) -> Result<BaseStep, AuthError> {
        match self.phase {
            AuthPhase::AwaitingIdentity => self.on_identity(message, store),
            AuthPhase::AwaitingChallengeResponse => self.on_challenge_response(message, store),
            AuthPhase::Authenticated => Err(AuthError::AlreadyAuthenticated),
            AuthPhase::Failed => Err(AuthError::Failed),
        }
    }

    /// Error notification for a rejection, sent under the zero key.
    pub fn rejection(error: &AuthError) -> Option<Message> {
        error
            .reply_code()
            .map(|code| Message::new(reply_header(), 0, vec![code]))
    }

    /// True for a payload shaped like a phase-one identity frame.
    pub fn is_identity_shaped(message: &Message) -> bool {
        let len = message.data.len();
        len == BASE_ID_SIZE || len == BASE_ID_SIZE + IDENTITY_PROOF_SIZE
    }

    fn on_identity(&mut self, message: &Message, store: &dyn Store) -> Result<BaseStep, AuthError> {
        if !Self::is_identity_shaped(message) {
            return Err(AuthError::MalformedIdentity(message.data.len()));
        }
        let identity = BaseId::from_slice(&message.data[..BASE_ID_SIZE])
            .ok_or(AuthError::MalformedIdentity(message.data.len()))?;
        self.identity = Some(identity);

        let decision = store.authenticate(
            Credential::Base(identity),
            self.remote,
            self.policy.attempt_limit,
            self.policy.window,
        )?;
        let grant = match decision {
            AuthDecision::Granted(grant) => grant,
            AuthDecision::Rejected { too_many_attempts } => {
                self.phase = AuthPhase::Failed;
                return Err(AuthError::Rejected { too_many_attempts });
            }
        };
        let key = grant
            .key
            .clone()
            .ok_or_else(|| StoreError::UnknownPeer(identity.to_hex()))?;

        let proof = &message.data[BASE_ID_SIZE..];
        if !proof.is_empty() && !proof_matches(&key, identity, proof) {
            self.fail(store, identity);
            return Err(AuthError::ProofMismatch);
        }

        let challenge = Challenge::generate();
        let reply = Message::new(reply_header(), 0, challenge.as_bytes().to_vec());
        self.pending = Some(PendingChallenge {
            identity,
            grant,
            challenge,
        });
        self.phase = AuthPhase::AwaitingChallengeResponse;

        Ok(BaseStep::Challenge { key, reply })
    }

    fn on_challenge_response(
        &mut self,
        message: &Message,
        store: &dyn Store,
    ) -> Result<BaseStep, AuthError> {
        let Some(pending) = self.pending.take() else {
            self.phase = AuthPhase::Failed;
            return Err(AuthError::Failed);
        };

        let echoed = message
            .data
            .get(CHALLENGE_RESPONSE_OFFSET..CHALLENGE_RESPONSE_SIZE);
        if !echoed.is_some_and(|echo| pending.challenge.matches(echo)) {
            self.fail(store, pending.identity);
            return Err(AuthError::ChallengeMismatch);
        }

        self.phase = AuthPhase::Authenticated;
        let session = store.open_session(&pending.grant.peer)?;
        let baseline = if message.header.is_sync() {
            0
        } else {
            session.stored_sequence
        };
        let reply = Message::new(
            reply_header().set(Header::SYNC, session.force_resync),
            0,
            vec![AUTH_OK],
        );

        Ok(BaseStep::Authenticated {
            grant: pending.grant,
            session,
            baseline,
            reply,
        })
    }

    fn fail(&mut self, store: &dyn Store, identity: BaseId) {
        self.phase = AuthPhase::Failed;
        if let Err(err) = store.record_auth_failure(&identity.to_hex(), self.remote) {
            warn!(%identity, %err, "could not record failed attempt");
        }
    }
}

/// Proof is `CBC(zero IV, device key)([16 random][identity])`.
fn proof_matches(key: &DeviceKey, identity: BaseId, proof: &[u8]) -> bool {
    let mut block = proof.to_vec();
    if BlockCipher::new(key).cbc_decrypt(&mut block).is_err() {
        return false;
    }
    block
        .get(BASE_ID_SIZE..2 * BASE_ID_SIZE)
        .is_some_and(|claimed| bool::from(claimed.ct_eq(identity.as_bytes().as_slice())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AUTH_REJECTED, AUTH_TOO_MANY, AUTH_VIOLATION, PeerId};
    use crate::store::MemoryStore;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));

    fn fixture() -> (MemoryStore, BaseId, DeviceKey) {
        let store = MemoryStore::new();
        let id = BaseId::from_bytes([0x21; 16]);
        let key = DeviceKey::from_bytes([0x77; 16]);
        store.add_base(id, key.clone());
        (store, id, key)
    }

    fn authenticator() -> BaseAuthenticator {
        BaseAuthenticator::new(
            REMOTE,
            AuthPolicy {
                attempt_limit: 3,
                window: Duration::from_secs(60),
            },
        )
    }

    fn identity_frame(id: BaseId) -> Message {
        Message::new(Header::NONE, 0, id.as_bytes().to_vec())
    }

    fn echo(challenge: &[u8], header: Header) -> Message {
        let mut data = vec![0xee; 16];
        data.extend_from_slice(challenge);
        Message::new(header, 1, data)
    }

    fn challenge_of(step: BaseStep) -> Vec<u8> {
        match step {
            BaseStep::Challenge { reply, .. } => reply.data,
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_full_handshake() {
        let (store, id, key) = fixture();
        store.save_receive_sequence(&PeerId::Base(id), 41).unwrap();
        let mut auth = authenticator();

        let step = auth.handle(&identity_frame(id), &store).unwrap();
        let BaseStep::Challenge { key: issued, reply } = step else {
            panic!("expected challenge");
        };
        assert_eq!(issued, key);
        assert_eq!(reply.header, Header::SYSTEM_MESSAGE | Header::NOTIFICATION);
        assert_eq!(reply.data.len(), 16);
        assert_eq!(auth.phase(), AuthPhase::AwaitingChallengeResponse);

        let step = auth.handle(&echo(&reply.data, Header::NONE), &store).unwrap();
        let BaseStep::Authenticated {
            grant,
            baseline,
            reply,
            ..
        } = step
        else {
            panic!("expected authenticated");
        };
        assert_eq!(grant.peer, PeerId::Base(id));
        assert_eq!(baseline, 41);
        assert_eq!(reply.data, vec![AUTH_OK]);
        assert!(auth.phase().is_authenticated());
        assert_eq!(auth.identity(), Some(id));
    }

    #[test]
    fn test_sync_resets_baseline() {
        let (store, id, _) = fixture();
        store.save_receive_sequence(&PeerId::Base(id), 41).unwrap();
        let mut auth = authenticator();

        let challenge = challenge_of(auth.handle(&identity_frame(id), &store).unwrap());
        match auth.handle(&echo(&challenge, Header::SYNC), &store).unwrap() {
            BaseStep::Authenticated { baseline, .. } => assert_eq!(baseline, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_force_resync_sets_sync_on_reply() {
        let (store, id, _) = fixture();
        let mut auth = authenticator();

        // Empty queue: the store resets the server sequence and says so.
        let challenge = challenge_of(auth.handle(&identity_frame(id), &store).unwrap());
        match auth.handle(&echo(&challenge, Header::NONE), &store).unwrap() {
            BaseStep::Authenticated { session, reply, .. } => {
                assert!(session.force_resync);
                assert!(reply.header.is_sync());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unproven_identity_keeps_server_sequence() {
        let (store, id, _) = fixture();
        let peer = PeerId::Base(id);
        store.enqueue(&peer, b"old").unwrap();
        store.ack(&peer, 1).unwrap();

        // Phase one alone, then a wrong echo: nothing proven.
        let mut auth = authenticator();
        auth.handle(&identity_frame(id), &store).unwrap();
        let _ = auth.handle(&echo(&[0u8; 16], Header::NONE), &store);
        assert_eq!(store.enqueue(&peer, b"next").unwrap(), 2);
    }

    #[test]
    fn test_valid_proof_accepted() {
        let (store, id, key) = fixture();
        let mut proof = [0x3c; 16].to_vec();
        proof.extend_from_slice(id.as_bytes());
        BlockCipher::new(&key).cbc_encrypt(&mut proof).unwrap();

        let mut data = id.as_bytes().to_vec();
        data.extend_from_slice(&proof);

        let mut auth = authenticator();
        let step = auth.handle(&Message::new(Header::NONE, 0, data), &store);
        assert!(matches!(step, Ok(BaseStep::Challenge { .. })));
    }

    #[test]
    fn test_forged_proof_rejected() {
        let (store, id, _) = fixture();
        let mut data = id.as_bytes().to_vec();
        data.extend_from_slice(&[0u8; 32]);

        let mut auth = authenticator();
        let err = auth
            .handle(&Message::new(Header::NONE, 0, data), &store)
            .unwrap_err();

        assert!(matches!(err, AuthError::ProofMismatch));
        assert_eq!(auth.phase(), AuthPhase::Failed);
        assert_eq!(store.auth_failures(REMOTE), 1);
    }

    #[test]
    fn test_unknown_identity() {
        let (store, _, _) = fixture();
        let mut auth = authenticator();

        let err = auth
            .handle(&identity_frame(BaseId::from_bytes([9; 16])), &store)
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Rejected {
                too_many_attempts: false
            }
        ));
        let reply = BaseAuthenticator::rejection(&err).unwrap();
        assert_eq!(reply.data, vec![AUTH_REJECTED]);
        assert_eq!(auth.phase(), AuthPhase::Failed);
    }

    #[test]
    fn test_rate_limited_address() {
        let (store, id, _) = fixture();
        for _ in 0..3 {
            store.record_auth_failure("probe", REMOTE).unwrap();
        }

        let mut auth = authenticator();
        let err = auth.handle(&identity_frame(id), &store).unwrap_err();
        assert_eq!(
            BaseAuthenticator::rejection(&err).unwrap().data,
            vec![AUTH_TOO_MANY]
        );
    }

    #[test]
    fn test_wrong_challenge_fails_absorbingly() {
        let (store, id, _) = fixture();
        let mut auth = authenticator();
        auth.handle(&identity_frame(id), &store).unwrap();

        let err = auth.handle(&echo(&[0u8; 16], Header::NONE), &store).unwrap_err();
        assert!(matches!(err, AuthError::ChallengeMismatch));
        assert_eq!(store.auth_failures(REMOTE), 1);

        let err = auth.handle(&identity_frame(id), &store).unwrap_err();
        assert!(matches!(err, AuthError::Failed));
        assert!(BaseAuthenticator::rejection(&err).is_none());
    }

    #[test]
    fn test_short_challenge_response() {
        let (store, id, _) = fixture();
        let mut auth = authenticator();
        auth.handle(&identity_frame(id), &store).unwrap();

        let err = auth
            .handle(&Message::new(Header::NONE, 1, vec![0u8; 20]), &store)
            .unwrap_err();
        assert!(matches!(err, AuthError::ChallengeMismatch));
    }

    #[test]
    fn test_malformed_identity_keeps_waiting() {
        let (store, id, _) = fixture();
        let mut auth = authenticator();

        let err = auth
            .handle(&Message::new(Header::NONE, 0, vec![1, 2, 3]), &store)
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedIdentity(3)));
        assert_eq!(auth.phase(), AuthPhase::AwaitingIdentity);

        assert!(auth.handle(&identity_frame(id), &store).is_ok());
    }

    #[test]
    fn test_identity_after_authentication_is_violation() {
        let (store, id, _) = fixture();
        let mut auth = authenticator();
        let challenge = challenge_of(auth.handle(&identity_frame(id), &store).unwrap());
        auth.handle(&echo(&challenge, Header::NONE), &store).unwrap();

        let err = auth.handle(&identity_frame(id), &store).unwrap_err();
        assert!(matches!(err, AuthError::AlreadyAuthenticated));
        assert_eq!(
            BaseAuthenticator::rejection(&err).unwrap().data,
            vec![AUTH_VIOLATION]
        );
    }
}
