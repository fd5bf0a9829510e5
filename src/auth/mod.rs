//! Authentication state machines.
//!
//! Both are sans-IO: the connection handler decodes frames, passes them in,
//! and writes whatever reply comes back under the key the step names.
//!
//! ```text
//! AwaitingIdentity ──identity ok──► AwaitingChallengeResponse ──echo ok──► Authenticated
//!        │                                   │
//!        └──────────── rejected ─────────────┴──────────────► Failed (absorbing)
//! ```
//!
//! `Failed` keeps the socket open until the auth timeout closes it, so a
//! directed attack shows up in the audit trail instead of as a flood of
//! short connections.

mod base;
mod client;

pub use base::{BaseAuthenticator, BaseStep};
pub use client::{ClientAuthenticator, ClientLogin};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// Waiting for the identity frame (Base) or login line (Client).
    AwaitingIdentity,
    /// Challenge issued, waiting for the echo.
    AwaitingChallengeResponse,
    /// Session may carry data.
    Authenticated,
    /// Rejected; nothing further is accepted.
    Failed,
}

impl AuthPhase {
    /// True once data traffic is allowed.
    pub fn is_authenticated(self) -> bool {
        self == AuthPhase::Authenticated
    }
}

/// Failed-attempt budget handed to the credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    /// Failures tolerated per window and remote address.
    pub attempt_limit: u32,
    /// Counting window.
    pub window: std::time::Duration,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            attempt_limit: crate::core::DEFAULT_BASE_AUTH_ATTEMPTS,
            window: crate::core::DEFAULT_AUTH_WINDOW,
        }
    }
}
