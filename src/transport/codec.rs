//! Encrypted frame codec.
//!
//! Wire format:
//! ```text
//! +----------------+------------------------------------------+-----------+
//! | Total length   | AES-128-CBC (zero IV) ciphertext         | CMAC      |
//! | 2 bytes (LE16) | [16 random IV][plain frame][IV padding]  | 16 bytes  |
//! +----------------+------------------------------------------+-----------+
//! ```
//! The length prefix counts ciphertext + CMAC. The CMAC covers the
//! ciphertext only and is checked before anything is decrypted.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Header, Message, put_plain, unpack_plain};
use crate::core::{
    BLOCK_SIZE, CMAC_SIZE, CodecError, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
    MIN_ENCRYPTED_FRAME_SIZE, RANDOM_IV_SIZE,
};
use crate::crypto::{BlockCipher, cmac, random_block, verify_cmac};

/// Where the leading IV block of an outbound frame comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvSource {
    /// Fresh bytes from the OS RNG.
    Random,
    /// Caller-supplied block (chained IV mode, tests).
    Explicit([u8; RANDOM_IV_SIZE]),
}

impl IvSource {
    fn block(self) -> [u8; RANDOM_IV_SIZE] {
        match self {
            IvSource::Random => random_block(),
            IvSource::Explicit(iv) => iv,
        }
    }
}

/// Build an encrypted frame.
pub fn build_encrypted(
    cipher: &BlockCipher,
    header: Header,
    sequence: u32,
    data: &[u8],
    iv: IvSource,
) -> Result<Bytes, CodecError> {
    let iv = iv.block();

    let mut region = BytesMut::with_capacity(RANDOM_IV_SIZE + data.len() + 2 * BLOCK_SIZE);
    region.put_slice(&iv);
    put_plain(&mut region, header, sequence, data)?;

    // Pad with IV bytes so the filler carries no fixed pattern.
    let padding = (BLOCK_SIZE - region.len() % BLOCK_SIZE) % BLOCK_SIZE;
    region.put_slice(&iv[..padding]);

    let total = region.len() + CMAC_SIZE;
    if total > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(total + LENGTH_PREFIX_SIZE));
    }

    cipher.cbc_encrypt(&mut region)?;
    let tag = cmac(cipher, &region);

    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + total);
    out.put_u16_le(total as u16);
    out.put_slice(&region);
    out.put_slice(&tag);
    Ok(out.freeze())
}

/// Verify and decrypt an encrypted frame.
///
/// Any error other than [`CodecError::Truncated`] means the frame must be
/// dropped without a reply.
pub fn unpack_encrypted(frame: &[u8], cipher: &BlockCipher) -> Result<Message, CodecError> {
    let len = frame.len();
    if len < MIN_ENCRYPTED_FRAME_SIZE {
        return Err(CodecError::TooShort(len));
    }
    if (len - LENGTH_PREFIX_SIZE - CMAC_SIZE) % BLOCK_SIZE != 0 {
        return Err(CodecError::Misaligned(len));
    }
    let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize + LENGTH_PREFIX_SIZE;
    if declared != len {
        return Err(CodecError::Truncated {
            expected: declared,
            actual: len,
        });
    }

    let (ciphertext, tag) = frame[LENGTH_PREFIX_SIZE..].split_at(len - LENGTH_PREFIX_SIZE - CMAC_SIZE);
    if !verify_cmac(cipher, ciphertext, tag) {
        return Err(CodecError::MacInvalid);
    }

    let mut plain = ciphertext.to_vec();
    cipher.cbc_decrypt(&mut plain)?;

    // A MAC-valid frame whose inner length overruns the region is malformed,
    // not incomplete.
    match unpack_plain(&plain[RANDOM_IV_SIZE..]) {
        Err(CodecError::Truncated { expected, .. }) => Err(CodecError::InvalidLength(expected)),
        other => other,
    }
}

/// Last ciphertext block of an encrypted frame, the chained-IV seed.
pub fn chain_block(frame: &[u8]) -> Option<[u8; BLOCK_SIZE]> {
    let end = frame.len().checked_sub(CMAC_SIZE)?;
    let start = end.checked_sub(BLOCK_SIZE)?;
    if start < LENGTH_PREFIX_SIZE {
        return None;
    }
    frame[start..end].try_into().ok()
}
