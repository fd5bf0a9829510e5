//! Protocol constants for the Base wire format and gateway defaults.
//!
//! Wire sizes are fixed by the device firmware and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// AES-128 block size.
pub const BLOCK_SIZE: usize = 16;

/// AES-128 key size.
pub const KEY_SIZE: usize = 16;

/// CMAC tag size (one full cipher block, never truncated).
pub const CMAC_SIZE: usize = 16;

/// Random IV prefix carried inside the encrypted region.
pub const RANDOM_IV_SIZE: usize = 16;

/// Challenge value issued during the second handshake phase.
pub const CHALLENGE_SIZE: usize = 16;

/// Base identity size.
pub const BASE_ID_SIZE: usize = 16;

/// Optional identity proof appended to the phase-one identity frame.
pub const IDENTITY_PROOF_SIZE: usize = 32;

/// Offset of the echoed challenge inside the phase-two response.
pub const CHALLENGE_RESPONSE_OFFSET: usize = 16;

/// Phase-two response size: 16 random bytes followed by the challenge.
pub const CHALLENGE_RESPONSE_SIZE: usize = CHALLENGE_RESPONSE_OFFSET + CHALLENGE_SIZE;

// =============================================================================
// FRAME SIZES
// =============================================================================

/// Length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Payload length + header + sequence.
pub const PLAIN_HEADER_SIZE: usize = 2 + 1 + 4;

/// Offset of the first data byte in a plain frame.
pub const DATA_OFFSET: usize = PLAIN_HEADER_SIZE;

/// Header byte + sequence, counted by the payload length field.
pub const PAYLOAD_OVERHEAD: usize = 1 + 4;

/// Smallest encrypted frame: prefix, IV block, one payload block, CMAC.
pub const MIN_ENCRYPTED_FRAME_SIZE: usize =
    LENGTH_PREFIX_SIZE + RANDOM_IV_SIZE + BLOCK_SIZE + CMAC_SIZE;

/// Largest frame that fits the 16-bit length prefix.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Largest data section a plain frame can carry (payload length is a u16).
pub const MAX_PLAIN_DATA: usize = MAX_FRAME_SIZE - PAYLOAD_OVERHEAD;

// =============================================================================
// SYSTEM SUB-MESSAGE CODES (first data byte of SYSTEM_MESSAGE frames)
// =============================================================================

/// Authentication accepted (gateway -> Base).
pub const AUTH_OK: u8 = 0x00;

/// Wrong identity or challenge response (gateway -> Base).
pub const AUTH_REJECTED: u8 = 0x01;

/// Too many failed attempts from this address (gateway -> Base).
pub const AUTH_TOO_MANY: u8 = 0x02;

/// Identity frame received on an authenticated session (gateway -> Base).
pub const AUTH_VIOLATION: u8 = 0x03;

/// Resend every unacknowledged queue item (Base -> gateway).
pub const SYS_RESEND_UNACKED: u8 = 0x01;

/// Enable keep-alive probes (Base -> gateway).
pub const SYS_KEEPALIVE_ON: u8 = 0x02;

/// Disable keep-alive probes (Base -> gateway).
pub const SYS_KEEPALIVE_OFF: u8 = 0x03;

/// Request server time (both directions, reply carries the same code).
pub const SYS_TIMESTAMP: u8 = 0x04;

/// Store the device variable (Base -> gateway).
pub const SYS_SET_VARIABLE: u8 = 0x05;

/// Fetch the device variable (both directions, reply carries the same code).
pub const SYS_GET_VARIABLE: u8 = 0x06;

/// Keep-alive probe (gateway -> Base).
pub const SYS_KEEPALIVE_PROBE: u8 = 0x07;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default Base listener port.
pub const DEFAULT_BASE_PORT: u16 = 8000;

/// Default Client listener port.
pub const DEFAULT_CLIENT_PORT: u16 = 9000;

/// Interval of the outbound delivery loop.
pub const DEFAULT_SENDER_INTERVAL: Duration = Duration::from_millis(500);

/// Queue entries written per delivery-loop tick.
pub const DEFAULT_SENDER_BATCH: usize = 32;

/// Time a fresh connection has to complete authentication.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// First backoff delay; doubles on each consecutive BACKOFF ack.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(3000);

/// Ceiling for the doubled backoff delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Consecutive out-of-sync events tolerated before flush-and-disconnect.
pub const DEFAULT_OUT_OF_SYNC_MAX: u32 = 5;

/// Failed authentication attempts tolerated per window.
pub const DEFAULT_BASE_AUTH_ATTEMPTS: u32 = 5;

/// Failed authentication attempts tolerated per window (Client population).
pub const DEFAULT_CLIENT_AUTH_ATTEMPTS: u32 = 10;

/// Window over which failed attempts are counted.
pub const DEFAULT_AUTH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Keep-alive probe interval for Bases.
pub const DEFAULT_BASE_KEEPALIVE: Duration = Duration::from_millis(5000);

/// Keep-alive probe interval for Clients.
pub const DEFAULT_CLIENT_KEEPALIVE: Duration = Duration::from_millis(10000);

/// Longest JSON line accepted from a Client before the connection is dropped.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Time one socket write may stall before the connection is closed.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Direct deliveries buffered per connection task; excess are dropped.
pub const DEFAULT_COMMAND_BUFFER: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_floor_is_fifty_bytes() {
        assert_eq!(MIN_ENCRYPTED_FRAME_SIZE, 50);
    }

    #[test]
    fn test_challenge_response_layout() {
        assert_eq!(CHALLENGE_RESPONSE_SIZE, 32);
        assert_eq!(DATA_OFFSET, 7);
        assert_eq!(MAX_PLAIN_DATA, 65_530);
    }
}
