//! Wire protocol shared with the relay
//!
//! Control messages travel as JSON text frames tagged by `type`. File chunks
//! travel as raw binary frames with no header; the receiver relies on arrival
//! order and the preceding `file_info` to rebuild the file.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// Side of a room a participant occupies, fixed for the session lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    /// The role on the other end of the room
    pub fn peer(&self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => Err(format!("invalid role `{}`, use 'sender' or 'receiver'", other)),
        }
    }
}

/// One frame on the duplex channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Encoded control message
    Text(String),
    /// Raw chunk bytes
    Binary(Bytes),
}

/// Control messages exchanged through the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Sent by the relay right after joining a room
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_connected: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_connected: Option<bool>,
    },
    PeerJoined {
        peer: Role,
    },
    PeerLeft {
        peer: Role,
    },
    /// Announces the next file; chunks follow as binary frames
    FileInfo {
        name: String,
        size: u64,
    },
    /// Relay-computed statistics for the running file
    Progress {
        #[serde(default)]
        transferred: u64,
        #[serde(default)]
        total_size: u64,
        #[serde(default)]
        speed: f64,
        #[serde(rename = "progress", default)]
        percentage: f64,
        #[serde(default, deserialize_with = "lenient_number")]
        eta: Option<f64>,
        #[serde(default, deserialize_with = "lenient_number")]
        elapsed: Option<f64>,
    },
    Complete {
        #[serde(
            default,
            deserialize_with = "lenient_number",
            skip_serializing_if = "Option::is_none"
        )]
        average_speed: Option<f64>,
    },
    Cancel {},
    Cancelled {},
    Error {
        message: String,
    },
}

impl WireMessage {
    /// Every `type` tag this protocol understands
    pub const KNOWN_TYPES: [&'static str; 9] = [
        "connected",
        "peer_joined",
        "peer_left",
        "file_info",
        "progress",
        "complete",
        "cancel",
        "cancelled",
        "error",
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Connected { .. } => "connected",
            WireMessage::PeerJoined { .. } => "peer_joined",
            WireMessage::PeerLeft { .. } => "peer_left",
            WireMessage::FileInfo { .. } => "file_info",
            WireMessage::Progress { .. } => "progress",
            WireMessage::Complete { .. } => "complete",
            WireMessage::Cancel {} => "cancel",
            WireMessage::Cancelled {} => "cancelled",
            WireMessage::Error { .. } => "error",
        }
    }
}

/// Encode a control message as a text frame
pub fn encode(msg: &WireMessage) -> serde_json::Result<Frame> {
    serde_json::to_string(msg).map(Frame::Text)
}

/// Decode a control frame
///
/// Unknown tags are reported separately from malformed messages so the
/// caller can log them at a lower level.
pub fn decode(frame: &Frame) -> Result<WireMessage, DecodeError> {
    match frame {
        Frame::Text(text) => decode_text(text),
        Frame::Binary(_) => Err(DecodeError::Binary),
    }
}

pub fn decode_text(text: &str) -> Result<WireMessage, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    if !WireMessage::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}

pub fn is_binary_frame(frame: &Frame) -> bool {
    matches!(frame, Frame::Binary(_))
}

/// The relay renders some numbers as human strings ("2m 5s", "calculating...")
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrOther {
        Number(f64),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<NumberOrOther>::deserialize(deserializer)? {
        Some(NumberOrOther::Number(n)) if n.is_finite() => Some(n),
        _ => None,
    })
}
