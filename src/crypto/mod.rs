//! Cryptographic primitives for the Base wire protocol.
//!
//! - [`BlockCipher`]: AES-128 with CBC chaining under a fixed zero IV
//! - [`cmac`]: RFC 4493 AES-CMAC over ciphertext
//! - [`DeviceKey`], [`Challenge`]: key material and handshake nonces
//!
//! Randomness is never fed to the cipher as an IV. Frames carry a random
//! 16-byte block as the first plaintext block instead, which keeps every
//! frame independently decryptable.

mod cipher;
mod cmac;
mod keys;

pub use cipher::BlockCipher;
pub use cmac::{cmac, verify_cmac};
pub use keys::{Challenge, DeviceKey, ParseKeyError, random_block};
