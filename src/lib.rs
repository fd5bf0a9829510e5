//! # Basegate
//!
//! Relay gateway between constrained field devices ("Bases") and
//! application clients ("Clients").
//!
//! Bases speak a compact little-endian binary protocol: every frame is
//! AES-128-CBC encrypted with a random first block and authenticated with
//! an RFC 4493 CMAC over the ciphertext. Clients speak newline-delimited
//! JSON carrying the same header flags. Between them the gateway provides
//! at-least-once delivery through a durable per-peer queue:
//!
//! - **Handshake**: two-phase challenge-response establishing the device key
//! - **Sequencing**: duplicate detection, gap detection with an out-of-sync
//!   circuit breaker that flushes the queue and forces a reconnect
//! - **Backoff**: receiver-requested pauses with exponential growth
//! - **Relay**: subscription fan-out, notifications for live peers only
//!
//! ## Feature Flags
//!
//! - `server` (default): tokio listeners, connection tasks, directory, router
//! - `cli` (default): the `basegate` binary
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, identifiers and the [`core::Store`] boundary
//! - [`crypto`]: AES-128 wrapper, CMAC, device keys
//! - [`transport`]: binary frame codec and the JSON line protocol
//! - [`auth`]: handshake state machines
//! - [`sync`]: sequence tracking, backoff, delivery engine, system messages
//! - [`store`]: in-memory [`core::Store`] implementation
//! - [`server`]: the running gateway (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use basegate::prelude::*;
//!
//! let key = DeviceKey::from_bytes([0x2b; 16]);
//! let cipher = BlockCipher::new(&key);
//!
//! let frame = build_encrypted(&cipher, Header::NONE, 7, b"reading", IvSource::Random)?;
//! let message = unpack_encrypted(&frame, &cipher)?;
//! assert_eq!(message.sequence, 7);
//! assert_eq!(message.data, b"reading");
//! # Ok::<(), CodecError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod auth;
pub mod core;
pub mod crypto;
pub mod store;
pub mod sync;
pub mod transport;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::auth::{AuthPhase, AuthPolicy, BaseAuthenticator, BaseStep, ClientAuthenticator};
    pub use crate::core::*;
    pub use crate::crypto::{BlockCipher, Challenge, DeviceKey, cmac, verify_cmac};
    pub use crate::store::MemoryStore;
    pub use crate::sync::{DeliveryConfig, DeliveryEngine, Escalation};
    pub use crate::transport::*;

    #[cfg(feature = "server")]
    pub use crate::server::{Gateway, GatewayConfig, IvMode, PopulationConfig, ShutdownHandle};
}

pub use core::{GatewayError, Store};
pub use store::MemoryStore;

#[cfg(feature = "server")]
pub use server::{Gateway, GatewayConfig};
