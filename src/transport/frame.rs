//! Plain frame layout, header bitfield, and stream extraction.
//!
//! Plain frame wire format (all integers little-endian):
//! ```text
//! +----------------+--------+------------------+-------------+
//! | Payload length | Header | Sequence         | Data        |
//! | 2 bytes (LE16) | 1 byte | 4 bytes (LE32)   | 0..N bytes  |
//! +----------------+--------+------------------+-------------+
//! ```
//! The payload length counts header + sequence + data. Anything after
//! `payload_length + 2` bytes is padding and is ignored.

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{
    CodecError, DATA_OFFSET, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, MAX_PLAIN_DATA, PAYLOAD_OVERHEAD,
};

/// Header bitfield carried by every frame.
///
/// Flags are orthogonal; the delivery engine decides which combinations
/// are meaningful.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Header(u8);

impl Header {
    /// No flags set (ordinary data).
    pub const NONE: Self = Self(0);
    /// Peer must reset its sequence expectation.
    pub const SYNC: Self = Self(0x01);
    /// Frame acknowledges `sequence`.
    pub const ACK: Self = Self(0x02);
    /// The acknowledged frame was accepted as fresh data.
    pub const PROCESSED: Self = Self(0x04);
    /// The acknowledged frame revealed a sequence gap.
    pub const OUT_OF_SYNC: Self = Self(0x08);
    /// Fire-and-forget; bypasses sequencing and ACKs.
    pub const NOTIFICATION: Self = Self(0x10);
    /// Control sub-message, never relayed.
    pub const SYSTEM_MESSAGE: Self = Self(0x20);
    /// Receiver is overloaded; sender must pause.
    pub const BACKOFF: Self = Self(0x40);
    /// Persist the receive sequence immediately.
    pub const SAVE_PEER_SEQUENCE: Self = Self(0x80);

    /// Create a header from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// True when every flag of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags of `other`.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Clear the flags of `other`.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Set or clear the flags of `other`.
    pub fn set(self, other: Self, on: bool) -> Self {
        if on { self.with(other) } else { self.without(other) }
    }

    /// Check if SYNC is set.
    pub fn is_sync(self) -> bool {
        self.contains(Self::SYNC)
    }

    /// Check if ACK is set.
    pub fn is_ack(self) -> bool {
        self.contains(Self::ACK)
    }

    /// Check if PROCESSED is set.
    pub fn is_processed(self) -> bool {
        self.contains(Self::PROCESSED)
    }

    /// Check if OUT_OF_SYNC is set.
    pub fn is_out_of_sync(self) -> bool {
        self.contains(Self::OUT_OF_SYNC)
    }

    /// Check if NOTIFICATION is set.
    pub fn is_notification(self) -> bool {
        self.contains(Self::NOTIFICATION)
    }

    /// Check if SYSTEM_MESSAGE is set.
    pub fn is_system(self) -> bool {
        self.contains(Self::SYSTEM_MESSAGE)
    }

    /// Check if BACKOFF is set.
    pub fn is_backoff(self) -> bool {
        self.contains(Self::BACKOFF)
    }

    /// Check if SAVE_PEER_SEQUENCE is set.
    pub fn is_save_peer_sequence(self) -> bool {
        self.contains(Self::SAVE_PEER_SEQUENCE)
    }
}

impl BitOr for Header {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Header({self})")
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Header, &str); 8] = [
            (Header::SYNC, "SYNC"),
            (Header::ACK, "ACK"),
            (Header::PROCESSED, "PROCESSED"),
            (Header::OUT_OF_SYNC, "OUT_OF_SYNC"),
            (Header::NOTIFICATION, "NOTIFICATION"),
            (Header::SYSTEM_MESSAGE, "SYSTEM"),
            (Header::BACKOFF, "BACKOFF"),
            (Header::SAVE_PEER_SEQUENCE, "SAVE_SEQ"),
        ];

        if self.0 == 0 {
            return f.write_str("-");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A decoded frame: header, sequence, and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header flags.
    pub header: Header,
    /// Sender's sequence (or the acknowledged sequence for ACKs).
    pub sequence: u32,
    /// Data section, padding removed.
    pub data: Vec<u8>,
}

impl Message {
    /// Create a new message.
    pub fn new(header: Header, sequence: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            header,
            sequence,
            data: data.into(),
        }
    }

    /// Create an empty acknowledgment for `sequence`.
    pub fn ack(header: Header, sequence: u32) -> Self {
        Self::new(header.with(Header::ACK), sequence, Vec::new())
    }

    /// First data byte, the sub-message code of system frames.
    pub fn code(&self) -> Option<u8> {
        self.data.first().copied()
    }
}

/// Locate one complete frame at the front of `buffer`.
///
/// Returns the frame bytes (prefix included) and the number of bytes to
/// consume, or `None` when more data is needed. Never fails: truncation is
/// the normal waiting state of a stream.
pub fn extract_frame(buffer: &[u8]) -> Option<(&[u8], usize)> {
    if buffer.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    let declared = u16::from_le_bytes([buffer[0], buffer[1]]) as usize;
    let total = declared + LENGTH_PREFIX_SIZE;
    if buffer.len() < total {
        return None;
    }
    Some((&buffer[..total], total))
}

/// Split one complete frame off the front of a read buffer.
pub fn split_frame(buffer: &mut BytesMut) -> Option<BytesMut> {
    let consumed = extract_frame(buffer)?.1;
    Some(buffer.split_to(consumed))
}

/// Parse a plain frame.
pub fn unpack_plain(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() < DATA_OFFSET {
        return Err(CodecError::Truncated {
            expected: DATA_OFFSET,
            actual: bytes.len(),
        });
    }

    let mut cursor = bytes;
    let payload_length = cursor.get_u16_le() as usize;
    if payload_length < PAYLOAD_OVERHEAD {
        return Err(CodecError::InvalidLength(payload_length));
    }
    let end = payload_length + LENGTH_PREFIX_SIZE;
    if bytes.len() < end {
        return Err(CodecError::Truncated {
            expected: end,
            actual: bytes.len(),
        });
    }

    let header = Header::from_byte(cursor.get_u8());
    let sequence = cursor.get_u32_le();

    Ok(Message {
        header,
        sequence,
        data: bytes[DATA_OFFSET..end].to_vec(),
    })
}

/// Serialize a plain frame.
pub fn build_plain(header: Header, sequence: u32, data: &[u8]) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::with_capacity(DATA_OFFSET + data.len());
    put_plain(&mut out, header, sequence, data)?;
    Ok(out.freeze())
}

/// Append a plain frame to `out`.
pub(crate) fn put_plain(
    out: &mut BytesMut,
    header: Header,
    sequence: u32,
    data: &[u8],
) -> Result<(), CodecError> {
    if data.len() > MAX_PLAIN_DATA {
        return Err(CodecError::TooLarge(data.len() + DATA_OFFSET));
    }
    debug_assert!(PAYLOAD_OVERHEAD + data.len() <= MAX_FRAME_SIZE);

    out.put_u16_le((PAYLOAD_OVERHEAD + data.len()) as u16);
    out.put_u8(header.as_byte());
    out.put_u32_le(sequence);
    out.put_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_flags() {
        let header = Header::ACK | Header::PROCESSED;

        assert!(header.is_ack());
        assert!(header.is_processed());
        assert!(!header.is_out_of_sync());
        assert_eq!(header.as_byte(), 0x06);
        assert_eq!(header.without(Header::ACK), Header::PROCESSED);
        assert_eq!(Header::NONE.set(Header::SYNC, true), Header::SYNC);
        assert_eq!(Header::SYNC.set(Header::SYNC, false), Header::NONE);
    }

    #[test]
    fn test_header_bit_positions() {
        let expected = [
            (Header::SYNC, 0x01),
            (Header::ACK, 0x02),
            (Header::PROCESSED, 0x04),
            (Header::OUT_OF_SYNC, 0x08),
            (Header::NOTIFICATION, 0x10),
            (Header::SYSTEM_MESSAGE, 0x20),
            (Header::BACKOFF, 0x40),
            (Header::SAVE_PEER_SEQUENCE, 0x80),
        ];
        for (flag, bit) in expected {
            assert_eq!(flag.as_byte(), bit);
        }
    }

    #[test]
    fn test_header_display() {
        assert_eq!(Header::NONE.to_string(), "-");
        assert_eq!(
            (Header::SYSTEM_MESSAGE | Header::NOTIFICATION).to_string(),
            "NOTIFICATION|SYSTEM"
        );
    }

    #[test]
    fn test_extract_needs_prefix() {
        assert!(extract_frame(&[]).is_none());
        assert!(extract_frame(&[5]).is_none());
    }

    #[test]
    fn test_extract_waits_for_full_frame() {
        let frame = build_plain(Header::NONE, 1, b"abc").unwrap();
        for cut in 0..frame.len() {
            assert!(extract_frame(&frame[..cut]).is_none(), "cut at {cut}");
        }
        let (bytes, consumed) = extract_frame(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(bytes, &frame[..]);
    }

    #[test]
    fn test_extract_leaves_trailing_bytes() {
        let mut stream = build_plain(Header::NONE, 1, b"one").unwrap().to_vec();
        let first_len = stream.len();
        stream.extend_from_slice(&build_plain(Header::NONE, 2, b"two").unwrap());

        let mut buffer = BytesMut::from(&stream[..]);
        let first = split_frame(&mut buffer).unwrap();
        assert_eq!(first.len(), first_len);
        assert_eq!(unpack_plain(&first).unwrap().data, b"one");

        let second = split_frame(&mut buffer).unwrap();
        assert_eq!(unpack_plain(&second).unwrap().sequence, 2);
        assert!(buffer.is_empty());
        assert!(split_frame(&mut buffer).is_none());
    }

    #[test]
    fn test_plain_layout() {
        let frame = build_plain(Header::SYNC, 0x0403_0201, &[0xaa, 0xbb]).unwrap();
        assert_eq!(
            &frame[..],
            &[0x07, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0xaa, 0xbb]
        );
    }

    #[test]
    fn test_unpack_ignores_padding() {
        let mut frame = build_plain(Header::ACK, 9, b"xy").unwrap().to_vec();
        frame.extend_from_slice(&[0xee; 7]);

        let message = unpack_plain(&frame).unwrap();
        assert_eq!(message, Message::new(Header::ACK, 9, b"xy".to_vec()));
    }

    #[test]
    fn test_unpack_empty_data() {
        let frame = build_plain(Header::ACK, 3, &[]).unwrap();
        assert_eq!(frame.len(), DATA_OFFSET);
        assert!(unpack_plain(&frame).unwrap().data.is_empty());
    }

    #[test]
    fn test_unpack_truncated() {
        let frame = build_plain(Header::NONE, 1, b"hello").unwrap();

        assert_eq!(
            unpack_plain(&frame[..3]),
            Err(CodecError::Truncated {
                expected: DATA_OFFSET,
                actual: 3
            })
        );
        assert_eq!(
            unpack_plain(&frame[..frame.len() - 1]),
            Err(CodecError::Truncated {
                expected: frame.len(),
                actual: frame.len() - 1
            })
        );
    }

    #[test]
    fn test_unpack_rejects_short_declared_length() {
        let frame = [0x04, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert_eq!(unpack_plain(&frame), Err(CodecError::InvalidLength(4)));
    }

    #[test]
    fn test_build_size_bound() {
        assert!(build_plain(Header::NONE, 1, &vec![0u8; MAX_PLAIN_DATA]).is_ok());
        assert!(matches!(
            build_plain(Header::NONE, 1, &vec![0u8; MAX_PLAIN_DATA + 1]),
            Err(CodecError::TooLarge(_))
        ));
    }

    #[test]
    fn test_message_helpers() {
        let ack = Message::ack(Header::PROCESSED, 12);
        assert!(ack.header.is_ack());
        assert!(ack.header.is_processed());
        assert_eq!(ack.code(), None);
        assert_eq!(Message::new(Header::SYSTEM_MESSAGE, 0, [4u8]).code(), Some(4));
    }
}
