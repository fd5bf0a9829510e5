//! Error types for the gateway.

use thiserror::Error;

/// Errors from frame extraction, parsing and building.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer holds fewer bytes than the frame declares.
    #[error("truncated frame: need {expected} bytes, have {actual}")]
    Truncated {
        /// Bytes required by the declared length.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Declared payload length cannot hold the header and sequence.
    #[error("declared payload length {0} below header size")]
    InvalidLength(usize),

    /// Encrypted frame below the minimum size.
    #[error("encrypted frame too short: {0} bytes")]
    TooShort(usize),

    /// Ciphertext + MAC do not align to cipher blocks.
    #[error("encrypted frame not block aligned: {0} bytes")]
    Misaligned(usize),

    /// CMAC verification failed.
    #[error("message authentication failed")]
    MacInvalid,

    /// Frame would exceed the 16-bit length prefix.
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

impl CodecError {
    /// Errors that must not produce any response to the peer.
    ///
    /// A peer that cannot produce a valid MAC learns nothing from us.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            CodecError::MacInvalid
                | CodecError::TooShort(_)
                | CodecError::Misaligned(_)
                | CodecError::InvalidLength(_)
        )
    }
}

/// Errors from the durable store boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Referenced peer is unknown to the store.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the authentication state machines.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credential store rejected the identity or token.
    #[error("authentication rejected")]
    Rejected {
        /// The remote address exceeded the failed-attempt budget.
        too_many_attempts: bool,
    },

    /// Identity frame had the wrong length.
    #[error("malformed identity payload: {0} bytes")]
    MalformedIdentity(usize),

    /// Login message carried no usable token.
    #[error("missing auth token")]
    MissingToken,

    /// Identity proof did not decrypt to the claimed identity.
    #[error("identity proof mismatch")]
    ProofMismatch,

    /// Phase-two response did not echo the issued challenge.
    #[error("challenge mismatch")]
    ChallengeMismatch,

    /// Identity payload received on an authenticated session.
    #[error("authorization violation: session already authenticated")]
    AlreadyAuthenticated,

    /// Session is in the absorbing failed state.
    #[error("authentication already failed")]
    Failed,

    /// Store lookup failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Rejections answered with an error notification (as opposed to dropped).
    pub fn reply_code(&self) -> Option<u8> {
        use super::constants::{AUTH_REJECTED, AUTH_TOO_MANY, AUTH_VIOLATION};

        match self {
            AuthError::Rejected {
                too_many_attempts: true,
            } => Some(AUTH_TOO_MANY),
            AuthError::Rejected { .. }
            | AuthError::ProofMismatch
            | AuthError::ChallengeMismatch => Some(AUTH_REJECTED),
            AuthError::AlreadyAuthenticated => Some(AUTH_VIOLATION),
            AuthError::MalformedIdentity(_)
            | AuthError::MissingToken
            | AuthError::Failed
            | AuthError::Store(_) => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has a value the gateway cannot run with.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Config file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for the schema.
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Authentication error.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Client line was not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer exceeded an inbound size limit.
    #[error("inbound message exceeds {0} bytes")]
    Oversized(usize),

    /// Peer stopped draining its socket.
    #[error("socket write stalled for {0:?}")]
    WriteTimeout(std::time::Duration),

    /// Peer was displaced by a newer authenticated connection.
    #[error("session displaced by a newer connection")]
    Displaced,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{AUTH_REJECTED, AUTH_TOO_MANY, AUTH_VIOLATION};

    #[test]
    fn test_silent_drop_errors() {
        assert!(CodecError::MacInvalid.is_silent_drop());
        assert!(CodecError::TooShort(10).is_silent_drop());
        assert!(CodecError::Misaligned(51).is_silent_drop());

        assert!(!CodecError::TooLarge(70_000).is_silent_drop());
        assert!(
            !CodecError::Truncated {
                expected: 9,
                actual: 3
            }
            .is_silent_drop()
        );
    }

    #[test]
    fn test_auth_reply_codes() {
        assert_eq!(
            AuthError::Rejected {
                too_many_attempts: false
            }
            .reply_code(),
            Some(AUTH_REJECTED)
        );
        assert_eq!(
            AuthError::Rejected {
                too_many_attempts: true
            }
            .reply_code(),
            Some(AUTH_TOO_MANY)
        );
        assert_eq!(AuthError::ChallengeMismatch.reply_code(), Some(AUTH_REJECTED));
        assert_eq!(
            AuthError::AlreadyAuthenticated.reply_code(),
            Some(AUTH_VIOLATION)
        );
        assert_eq!(AuthError::MalformedIdentity(3).reply_code(), None);
        assert_eq!(
            AuthError::Store(StoreError::Unavailable("down".into())).reply_code(),
            None
        );
    }
}
