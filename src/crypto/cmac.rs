//! RFC 4493 AES-CMAC.
//!
//! Pure function of `(key, message)`. Used over the ciphertext region of
//! every encrypted frame.

use subtle::ConstantTimeEq;

use super::cipher::BlockCipher;
use crate::core::{BLOCK_SIZE, CMAC_SIZE};

/// Rb for a 128-bit block.
const RB: u8 = 0x87;

/// GF(2^128) doubling: shift left one bit, fold the carry back in with Rb.
fn dbl(block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut out = [0u8; BLOCK_SIZE];
    let mut carry = 0u8;
    for i in (0..BLOCK_SIZE).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }
    if carry != 0 {
        out[BLOCK_SIZE - 1] ^= RB;
    }
    out
}

/// Derive (K1, K2) from `L = AES(K, 0^128)`.
fn subkeys(cipher: &BlockCipher) -> ([u8; BLOCK_SIZE], [u8; BLOCK_SIZE]) {
    let mut l = [0u8; BLOCK_SIZE];
    cipher.encrypt_block(&mut l);
    let k1 = dbl(&l);
    let k2 = dbl(&k1);
    (k1, k2)
}

fn xor_into(dst: &mut [u8; BLOCK_SIZE], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Compute the 16-byte AES-CMAC of `message`.
pub fn cmac(cipher: &BlockCipher, message: &[u8]) -> [u8; CMAC_SIZE] {
    let (k1, k2) = subkeys(cipher);

    // The last block is always processed separately, even when empty.
    let complete = !message.is_empty() && message.len() % BLOCK_SIZE == 0;
    let last_start = if message.is_empty() {
        0
    } else if complete {
        message.len() - BLOCK_SIZE
    } else {
        message.len() - message.len() % BLOCK_SIZE
    };

    let mut last = [0u8; BLOCK_SIZE];
    let tail = &message[last_start..];
    last[..tail.len()].copy_from_slice(tail);
    if complete {
        xor_into(&mut last, &k1);
    } else {
        last[tail.len()] = 0x80;
        xor_into(&mut last, &k2);
    }

    let mut x = [0u8; BLOCK_SIZE];
    for block in message[..last_start].chunks_exact(BLOCK_SIZE) {
        xor_into(&mut x, block);
        cipher.encrypt_block(&mut x);
    }
    xor_into(&mut x, &last);
    cipher.encrypt_block(&mut x);
    x
}

/// Verify a received tag in constant time.
pub fn verify_cmac(cipher: &BlockCipher, message: &[u8], tag: &[u8]) -> bool {
    let expected = cmac(cipher, message);
    tag.len() == CMAC_SIZE && bool::from(expected[..].ct_eq(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DeviceKey;

    const RFC_KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const RFC_MESSAGE: &str = concat!(
        "6bc1bee22e409f96e93d7e117393172a",
        "ae2d8a571e03ac9c9eb76fac45af8e51",
        "30c81c46a35ce411e5fbc1191a0a52ef",
        "f69f2445df4f9b17ad2b417be66c3710",
    );

    fn rfc_cipher() -> BlockCipher {
        BlockCipher::new(&RFC_KEY.parse::<DeviceKey>().unwrap())
    }

    fn rfc_tag(len: usize) -> String {
        let message = hex::decode(RFC_MESSAGE).unwrap();
        hex::encode(cmac(&rfc_cipher(), &message[..len]))
    }

    #[test]
    fn test_rfc4493_subkeys() {
        let (k1, k2) = subkeys(&rfc_cipher());
        assert_eq!(hex::encode(k1), "fbeed618357133667c85e08f7236a8de");
        assert_eq!(hex::encode(k2), "f7ddac306ae266ccf90bc11ee46d513b");
    }

    #[test]
    fn test_rfc4493_empty_message() {
        assert_eq!(rfc_tag(0), "bb1d6929e95937287fa37d129b756746");
    }

    #[test]
    fn test_rfc4493_one_block() {
        assert_eq!(rfc_tag(16), "070a16b46b4d4144f79bdd9dd04a287c");
    }

    #[test]
    fn test_rfc4493_partial_last_block() {
        assert_eq!(rfc_tag(40), "dfa66747de9ae63030ca32611497c827");
    }

    #[test]
    fn test_rfc4493_four_blocks() {
        assert_eq!(rfc_tag(64), "51f0bebf7e3b9d92fc49741779363cfe");
    }

    #[test]
    fn test_verify_rejects_wrong_tag() {
        let cipher = rfc_cipher();
        let mut tag = cmac(&cipher, b"payload");

        assert!(verify_cmac(&cipher, b"payload", &tag));
        tag[15] ^= 1;
        assert!(!verify_cmac(&cipher, b"payload", &tag));
        assert!(!verify_cmac(&cipher, b"payload", &tag[..15]));
    }

    #[test]
    fn test_key_changes_tag() {
        let other = BlockCipher::new(&DeviceKey::zero());
        assert_ne!(cmac(&rfc_cipher(), b"abc"), cmac(&other, b"abc"));
    }
}
