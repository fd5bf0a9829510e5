//! AES-128 block cipher with zero-IV CBC chaining.

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};

use super::keys::DeviceKey;
use crate::core::{BLOCK_SIZE, CodecError};

/// Keyed AES-128 instance.
///
/// CBC always starts from an all-zero IV; callers put randomness in the
/// first plaintext block.
#[derive(Clone)]
pub struct BlockCipher {
    inner: Aes128,
}

impl BlockCipher {
    /// Expand the key schedule.
    pub fn new(key: &DeviceKey) -> Self {
        Self {
            inner: Aes128::new(GenericArray::from_slice(key.as_bytes())),
        }
    }

    /// Encrypt one block in place (ECB).
    pub fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.inner
            .encrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
    }

    /// Decrypt one block in place (ECB).
    pub fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.inner
            .decrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
    }

    /// CBC-encrypt in place with a zero IV.
    pub fn cbc_encrypt(&self, data: &mut [u8]) -> Result<(), CodecError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CodecError::Misaligned(data.len()));
        }

        let mut chain = [0u8; BLOCK_SIZE];
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            for (b, c) in chunk.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            self.inner.encrypt_block(GenericArray::from_mut_slice(chunk));
            chain.copy_from_slice(chunk);
        }
        Ok(())
    }

    /// CBC-decrypt in place with a zero IV.
    pub fn cbc_decrypt(&self, data: &mut [u8]) -> Result<(), CodecError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CodecError::Misaligned(data.len()));
        }

        let mut chain = [0u8; BLOCK_SIZE];
        let mut saved = [0u8; BLOCK_SIZE];
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            saved.copy_from_slice(chunk);
            self.inner.decrypt_block(GenericArray::from_mut_slice(chunk));
            for (b, c) in chunk.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            chain = saved;
        }
        Ok(())
    }
}
