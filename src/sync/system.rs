//! Control sub-messages carried in SYSTEM_MESSAGE frames.
//!
//! These are interpreted by the gateway and never relayed.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::core::{
    SYS_GET_VARIABLE, SYS_KEEPALIVE_OFF, SYS_KEEPALIVE_ON, SYS_KEEPALIVE_PROBE,
    SYS_RESEND_UNACKED, SYS_SET_VARIABLE, SYS_TIMESTAMP,
};
use crate::transport::{ClientMessage, Header, Message};

/// Base-originated control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemCommand {
    /// Mark every unacknowledged entry unsent and restart delivery.
    ResendUnacked,
    /// Turn keep-alive probes on or off.
    KeepAlive(bool),
    /// Reply with server time and the installation's timezone offset.
    Timestamp,
    /// Replace the stored device variable.
    SetVariable(Vec<u8>),
    /// Reply with the stored device variable.
    GetVariable,
    /// Unrecognized code.
    Unknown(u8),
}

impl SystemCommand {
    /// Parse from frame data. `None` for an empty body.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&code, rest) = data.split_first()?;
        Some(match code {
            SYS_RESEND_UNACKED => SystemCommand::ResendUnacked,
            SYS_KEEPALIVE_ON => SystemCommand::KeepAlive(true),
            SYS_KEEPALIVE_OFF => SystemCommand::KeepAlive(false),
            SYS_TIMESTAMP => SystemCommand::Timestamp,
            SYS_SET_VARIABLE => SystemCommand::SetVariable(rest.to_vec()),
            SYS_GET_VARIABLE => SystemCommand::GetVariable,
            other => SystemCommand::Unknown(other),
        })
    }
}

/// Client-originated control request (`data.type`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `pull_unacked`
    PullUnacked,
    /// `timestamp`
    Timestamp,
    /// Anything else
    Unknown(String),
}

impl ClientCommand {
    /// Parse from a system line body.
    pub fn parse(data: &Value) -> Self {
        match data.get("type").and_then(Value::as_str) {
            Some("pull_unacked") => ClientCommand::PullUnacked,
            Some("timestamp") => ClientCommand::Timestamp,
            Some(other) => ClientCommand::Unknown(other.to_string()),
            None => ClientCommand::Unknown(String::new()),
        }
    }
}

fn reply_header() -> Header {
    Header::SYSTEM_MESSAGE | Header::NOTIFICATION
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// `[0x04][u32 LE unix seconds][i16 LE timezone minutes]`
pub fn timestamp_reply(unix_seconds: u64, timezone_offset_minutes: i16) -> Message {
    let seconds = u32::try_from(unix_seconds).unwrap_or(u32::MAX);
    let mut data = Vec::with_capacity(7);
    data.push(SYS_TIMESTAMP);
    data.extend_from_slice(&seconds.to_le_bytes());
    data.extend_from_slice(&timezone_offset_minutes.to_le_bytes());
    Message::new(reply_header(), 0, data)
}

/// `[0x06][value]`
pub fn variable_reply(value: &[u8]) -> Message {
    let mut data = Vec::with_capacity(1 + value.len());
    data.push(SYS_GET_VARIABLE);
    data.extend_from_slice(value);
    Message::new(reply_header(), 0, data)
}

/// `[0x07]`
pub fn keepalive_probe() -> Message {
    Message::new(reply_header(), 0, vec![SYS_KEEPALIVE_PROBE])
}

/// JSON equivalent of [`keepalive_probe`].
pub fn client_keepalive_probe() -> ClientMessage {
    ClientMessage::keep_alive()
}
