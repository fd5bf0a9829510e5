//! Sequencing and reliable delivery
//!
//! Implements:
//! - Per-peer receive sequence with duplicate and gap detection
//! - ACK / NACK verdicts with an out-of-sync circuit breaker
//! - Exponential backoff on receiver overload
//! - The timer-driven delivery loop switch
//! - Control sub-messages that never leave the gateway

mod backoff;
mod engine;
mod receiver;
mod sender;
mod system;

pub use backoff::*;
pub use engine::*;
pub use receiver::*;
pub use sender::*;
pub use system::*;
