//! Device keys and handshake challenges.

use std::fmt;
use std::str::FromStr;

use rand::{RngCore, rngs::OsRng};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::{BLOCK_SIZE, CHALLENGE_SIZE, KEY_SIZE};

/// Permanent per-device AES-128 key.
///
/// Zeroized on drop. `Debug` never prints the key bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Deserialize)]
#[serde(try_from = "String")]
pub struct DeviceKey([u8; KEY_SIZE]);

impl DeviceKey {
    /// The universal all-zero key used before a device is identified.
    pub fn zero() -> Self {
        Self([0u8; KEY_SIZE])
    }

    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// True for the universal zero key.
    pub fn is_zero(&self) -> bool {
        self.0[..].ct_eq(&[0u8; KEY_SIZE][..]).into()
    }
}

impl PartialEq for DeviceKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for DeviceKey {}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            f.write_str("DeviceKey(zero)")
        } else {
            f.write_str("DeviceKey(..)")
        }
    }
}

/// Error parsing a [`DeviceKey`] from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device key must be {} hex characters", KEY_SIZE * 2)]
pub struct ParseKeyError;

impl FromStr for DeviceKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut key = [0u8; KEY_SIZE];
        hex::decode_to_slice(s.trim(), &mut key).map_err(|_| ParseKeyError)?;
        Ok(Self(key))
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = ParseKeyError;

    fn try_from(mut value: String) -> Result<Self, Self::Error> {
        let parsed = value.parse();
        value.zeroize();
        parsed
    }
}

/// Fresh 16-byte challenge issued in handshake phase one.
///
/// Valid for one handshake only.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Challenge([u8; CHALLENGE_SIZE]);

impl Challenge {
    /// Generate a random challenge.
    pub fn generate() -> Self {
        let mut value = [0u8; CHALLENGE_SIZE];
        OsRng.fill_bytes(&mut value);
        Self(value)
    }

    /// Create a challenge from raw bytes (tests, replay fixtures).
    pub fn from_bytes(bytes: [u8; CHALLENGE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the challenge bytes.
    pub fn as_bytes(&self) -> &[u8; CHALLENGE_SIZE] {
        &self.0
    }

    /// Constant-time comparison against an echoed value.
    pub fn matches(&self, echoed: &[u8]) -> bool {
        echoed.len() == CHALLENGE_SIZE && bool::from(self.0[..].ct_eq(echoed))
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Challenge(..)")
    }
}

/// 16 random bytes from the OS RNG.
pub fn random_block() -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut block);
    block
}
