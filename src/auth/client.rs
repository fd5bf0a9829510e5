//! Client token login.

use std::net::IpAddr;

use super::{AuthPhase, AuthPolicy};
use crate::core::{AuthDecision, AuthError, AuthGrant, Credential, SessionStart, Store};
use crate::transport::{AuthResult, ClientMessage};

/// Accepted login.
#[derive(Debug)]
pub struct ClientLogin {
    /// Store grant for the Client.
    pub grant: AuthGrant,
    /// Sequencing state opened for the session.
    pub session: SessionStart,
    /// Receive-sequence baseline for the session.
    pub baseline: u32,
    /// `authentication_response` to send.
    pub reply: ClientMessage,
}

/// Per-connection Client authenticator.
pub struct ClientAuthenticator {
    phase: AuthPhase,
    remote: IpAddr,
    policy: AuthPolicy,
}

impl ClientAuthenticator {
    /// Start in `AwaitingIdentity`.
    pub fn new(remote: IpAddr, policy: AuthPolicy) -> Self {
        Self {
            phase: AuthPhase::AwaitingIdentity,
            remote,
            policy,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Feed the first line of the connection.
    pub fn handle(
        &mut self,
        message: &ClientMessage,
        store: &dyn Store,
    ) -> Result<ClientLogin, AuthError> {
        match self.phase {
            AuthPhase::AwaitingIdentity | AuthPhase::AwaitingChallengeResponse => {}
            AuthPhase::Authenticated => return Err(AuthError::AlreadyAuthenticated),
            AuthPhase::Failed => return Err(AuthError::Failed),
        }

        let Some(token) = message.auth_token() else {
            self.phase = AuthPhase::Failed;
            if let Err(err) = store.record_auth_failure("client-token", self.remote) {
                tracing::warn!(%err, "could not record failed attempt");
            }
            return Err(AuthError::MissingToken);
        };

        let decision = store.authenticate(
            Credential::Client(token),
            self.remote,
            self.policy.attempt_limit,
            self.policy.window,
        )?;
        match decision {
            AuthDecision::Granted(grant) => {
                self.phase = AuthPhase::Authenticated;
                let session = store.open_session(&grant.peer)?;
                let baseline = if message.flags().is_sync() {
                    0
                } else {
                    session.stored_sequence
                };
                let reply = ClientMessage::auth_response(AuthResult::Ok, session.force_resync);
                Ok(ClientLogin {
                    grant,
                    session,
                    baseline,
                    reply,
                })
            }
            AuthDecision::Rejected { too_many_attempts } => {
                self.phase = AuthPhase::Failed;
                Err(AuthError::Rejected { too_many_attempts })
            }
        }
    }

    /// Reply for a failed login, if the failure is answered at all.
    pub fn rejection(error: &AuthError) -> Option<ClientMessage> {
        let result = match error {
            AuthError::Rejected {
                too_many_attempts: true,
            } => AuthResult::TooManyAttempts,
            AuthError::Rejected { .. } | AuthError::MissingToken => AuthResult::WrongToken,
            _ => return None,
        };
        Some(ClientMessage::auth_response(result, false))
    }
}
