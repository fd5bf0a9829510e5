//! Client line protocol: newline-delimited JSON objects.
//!
//! Every line carries the same header flags as a binary frame, spelled as
//! booleans, plus the sender's sequence (`TXsender`), an optional Base
//! target list, and the data (hex string or object).

use bytes::BytesMut;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use super::frame::Header;
use crate::core::{BaseId, CodecError};

/// Header flags as JSON booleans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonHeader {
    /// See [`Header::ACK`].
    pub ack: bool,
    /// See [`Header::SYNC`].
    pub sync: bool,
    /// See [`Header::PROCESSED`].
    pub processed: bool,
    /// See [`Header::OUT_OF_SYNC`].
    pub out_of_sync: bool,
    /// See [`Header::NOTIFICATION`].
    pub notification: bool,
    /// See [`Header::SYSTEM_MESSAGE`].
    pub system_message: bool,
    /// See [`Header::BACKOFF`].
    pub backoff: bool,
    /// See [`Header::SAVE_PEER_SEQUENCE`].
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub save_peer_sequence: bool,
}

impl From<JsonHeader> for Header {
    fn from(h: JsonHeader) -> Self {
        Header::NONE
            .set(Header::ACK, h.ack)
            .set(Header::SYNC, h.sync)
            .set(Header::PROCESSED, h.processed)
            .set(Header::OUT_OF_SYNC, h.out_of_sync)
            .set(Header::NOTIFICATION, h.notification)
            .set(Header::SYSTEM_MESSAGE, h.system_message)
            .set(Header::BACKOFF, h.backoff)
            .set(Header::SAVE_PEER_SEQUENCE, h.save_peer_sequence)
    }
}

impl From<Header> for JsonHeader {
    fn from(h: Header) -> Self {
        Self {
            ack: h.is_ack(),
            sync: h.is_sync(),
            processed: h.is_processed(),
            out_of_sync: h.is_out_of_sync(),
            notification: h.is_notification(),
            system_message: h.is_system(),
            backoff: h.is_backoff(),
            save_peer_sequence: h.is_save_peer_sequence(),
        }
    }
}

/// One line of the Client protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Header flags.
    #[serde(default)]
    pub header: JsonHeader,
    /// Sender's sequence (or the acknowledged sequence).
    #[serde(rename = "TXsender", default)]
    pub tx_sender: u32,
    /// Hex Base ids; accepted as a single string or an array.
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub baseid: Vec<String>,
    /// Hex payload for Bases, or an object for system traffic.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

impl ClientMessage {
    /// Create a message from parts.
    pub fn new(header: Header, tx_sender: u32, data: Value) -> Self {
        Self {
            header: header.into(),
            tx_sender,
            baseid: Vec::new(),
            data,
        }
    }

    /// Acknowledgment of `sequence`.
    pub fn ack(header: Header, sequence: u32) -> Self {
        Self::new(header.with(Header::ACK), sequence, Value::Null)
    }

    /// Relayed Base payload, hex encoded and tagged with its origin.
    pub fn from_base(sequence: u32, origin: BaseId, payload: &[u8]) -> Self {
        Self {
            header: JsonHeader::default(),
            tx_sender: sequence,
            baseid: vec![origin.to_hex()],
            data: Value::String(hex::encode(payload)),
        }
    }

    /// System notification with a typed object body.
    pub fn system(header: Header, body: Value) -> Self {
        Self::new(
            header.with(Header::SYSTEM_MESSAGE | Header::NOTIFICATION),
            0,
            body,
        )
    }

    /// Login reply.
    pub fn auth_response(result: AuthResult, sync: bool) -> Self {
        Self::system(
            Header::NONE.set(Header::SYNC, sync),
            json!({
                "type": "authentication_response",
                "result": result as u8,
                "description": result.description(),
            }),
        )
    }

    /// Presence change of a Base.
    pub fn base_status(base: BaseId, connected: bool) -> Self {
        Self::system(
            Header::NONE,
            json!({
                "type": "base_connection_status",
                "baseid": base.to_hex(),
                "connected": connected,
            }),
        )
    }

    /// Keep-alive probe.
    pub fn keep_alive() -> Self {
        Self::system(Header::NONE, json!({ "type": "keep_alive" }))
    }

    /// Server time reply.
    pub fn timestamp(unix_seconds: u64, timezone_offset_minutes: i16) -> Self {
        Self::system(
            Header::NONE,
            json!({
                "type": "timestamp",
                "timestamp": unix_seconds,
                "timezone_offset": timezone_offset_minutes,
            }),
        )
    }

    /// Header as a bitfield.
    pub fn flags(&self) -> Header {
        self.header.into()
    }

    /// `type` field of an object body.
    pub fn data_type(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }

    /// `auth_token` field of a login body.
    pub fn auth_token(&self) -> Option<&str> {
        self.data
            .get("auth_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
    }

    /// Decode a hex data string into Base payload bytes.
    pub fn hex_payload(&self) -> Option<Vec<u8>> {
        self.data.as_str().and_then(|s| hex::decode(s).ok())
    }

    /// Parse one line.
    pub fn parse(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }

    /// Serialize as one newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// `result` codes of the login reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthResult {
    /// Token accepted.
    Ok = 0,
    /// Token unknown.
    WrongToken = 1,
    /// Too many failed attempts from this address.
    TooManyAttempts = 2,
}

impl AuthResult {
    /// Human readable description sent with the code.
    pub fn description(self) -> &'static str {
        match self {
            AuthResult::Ok => "authenticated",
            AuthResult::WrongToken => "wrong auth token",
            AuthResult::TooManyAttempts => "too many failed attempts, try again later",
        }
    }
}

/// Split one line off the front of a read buffer.
///
/// The terminator and an optional preceding `\r` are removed. Fails once
/// `max_len` bytes are buffered without a newline.
pub fn split_line(buffer: &mut BytesMut, max_len: usize) -> Result<Option<BytesMut>, CodecError> {
    match buffer.iter().position(|&b| b == b'\n') {
        Some(pos) if pos > max_len => Err(CodecError::TooLarge(pos)),
        Some(pos) => {
            let mut line = buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            Ok(Some(line))
        }
        None if buffer.len() > max_len => Err(CodecError::TooLarge(buffer.len())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_message() {
        let line = br#"{"header":{"ack":false,"sync":true,"processed":false,"out_of_sync":false,"notification":false,"system_message":false,"backoff":false},"TXsender":4,"baseid":["00112233445566778899aabbccddeeff"],"data":"cafe"}"#;
        let message = ClientMessage::parse(line).unwrap();

        assert!(message.flags().is_sync());
        assert_eq!(message.tx_sender, 4);
        assert_eq!(message.baseid.len(), 1);
        assert_eq!(message.hex_payload(), Some(vec![0xca, 0xfe]));
    }

    #[test]
    fn test_parse_single_baseid_and_missing_fields() {
        let message = ClientMessage::parse(br#"{"baseid":"ab","data":{"type":"pull_unacked"}}"#)
            .unwrap();

        assert_eq!(message.baseid, vec!["ab".to_string()]);
        assert_eq!(message.flags(), Header::NONE);
        assert_eq!(message.tx_sender, 0);
        assert_eq!(message.data_type(), Some("pull_unacked"));
        assert_eq!(message.hex_payload(), None);
    }

    #[test]
    fn test_parse_null_baseid() {
        let message = ClientMessage::parse(br#"{"baseid":null,"TXsender":1}"#).unwrap();
        assert!(message.baseid.is_empty());
    }

    #[test]
    fn test_auth_token() {
        let login = ClientMessage::parse(br#"{"data":{"auth_token":"t0k"}}"#).unwrap();
        assert_eq!(login.auth_token(), Some("t0k"));

        let empty = ClientMessage::parse(br#"{"data":{"auth_token":""}}"#).unwrap();
        assert_eq!(empty.auth_token(), None);
    }

    #[test]
    fn test_header_mapping_is_lossless() {
        for byte in 0..=u8::MAX {
            let header = Header::from_byte(byte);
            assert_eq!(Header::from(JsonHeader::from(header)), header);
        }
    }

    #[test]
    fn test_ack_serialization() {
        let line = ClientMessage::ack(Header::PROCESSED, 9).to_line().unwrap();
        assert!(line.ends_with('\n'));

        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["header"]["ack"], true);
        assert_eq!(value["header"]["processed"], true);
        assert_eq!(value["TXsender"], 9);
        assert!(value.get("data").is_none());
        assert!(value.get("baseid").is_none());
    }

    #[test]
    fn test_from_base_is_hex_tagged() {
        let origin = BaseId::from_bytes([0x11; 16]);
        let message = ClientMessage::from_base(3, origin, &[0xde, 0xad]);

        assert_eq!(message.data, Value::String("dead".into()));
        assert_eq!(message.baseid, vec![origin.to_hex()]);
    }

    #[test]
    fn test_auth_response_body() {
        let message = ClientMessage::auth_response(AuthResult::TooManyAttempts, false);
        assert!(message.flags().is_system());
        assert!(message.flags().is_notification());
        assert_eq!(message.data["type"], "authentication_response");
        assert_eq!(message.data["result"], 2);
    }

    #[test]
    fn test_split_line() {
        let mut buffer = BytesMut::from(&b"{\"a\":1}\r\n{\"b\""[..]);

        let line = split_line(&mut buffer, 64).unwrap().unwrap();
        assert_eq!(&line[..], b"{\"a\":1}");
        assert!(split_line(&mut buffer, 64).unwrap().is_none());
        assert_eq!(&buffer[..], b"{\"b\"");
    }

    #[test]
    fn test_split_line_limit() {
        let mut buffer = BytesMut::from(&[b'x'; 10][..]);
        assert_eq!(split_line(&mut buffer, 8), Err(CodecError::TooLarge(10)));

        let mut buffer = BytesMut::from(&b"0123456789\n"[..]);
        assert_eq!(split_line(&mut buffer, 8), Err(CodecError::TooLarge(10)));
    }
}
