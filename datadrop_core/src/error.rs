//! Error types for the transfer core
//!
//! Lower layers (wire protocol, engines) report typed errors; only the
//! session decides whether a failure ends the whole session.

use crate::protocol::Role;
use thiserror::Error;

/// Failure to turn a frame into a [`WireMessage`](crate::protocol::WireMessage)
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Binary frames carry chunk bytes, never control messages
    #[error("binary frame is not a control message")]
    Binary,

    #[error("control frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("control frame has no `type` tag")]
    MissingType,

    /// Tag not in the closed message set (e.g. `pong`, `transfer_started`)
    #[error("unknown control message type `{0}`")]
    UnknownType(String),

    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Unknown tags are expected chatter from the relay, not a fault
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, DecodeError::UnknownType(_))
    }
}

/// Session-level failures, also used to reject outgoing frames
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("peer has not joined the room")]
    PeerNotReady,

    #[error("peer left the room")]
    PeerLeft,

    #[error("relay channel closed")]
    ChannelClosed,

    #[error("cannot connect to relay: {0}")]
    Connect(String),

    #[error("operation requires the {0} role")]
    WrongRole(Role),

    #[error("a transfer queue is already running")]
    Busy,

    /// The outgoing queue was cancelled; nothing more of it goes out
    #[error("transfer was cancelled")]
    Cancelled,
}

/// Failure of a single file transfer
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to read chunk: {0}")]
    Read(#[from] std::io::Error),

    #[error("channel write failed: {0}")]
    Channel(#[from] SessionError),

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("file rejected: {size} bytes exceeds maximum of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("file rejected: name too long ({len} chars, max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("received {received} bytes but {expected} were announced")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("unexpected {0}")]
    Unexpected(&'static str),

    #[error("relay reported an error: {0}")]
    Remote(String),

    #[error("failed to store file: {0}")]
    Sink(String),
}

/// Failures of the underlying duplex channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    WebSocket(String),
}
