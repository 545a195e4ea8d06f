use serde::Serialize;

use crate::protocol::{Role, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerPresence {
    WaitingForPeer,
    PeerReady,
}

/// What a presence message changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(Role),
    Left(Role),
}

/// Snapshot of one participant's view of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub room_id: String,
    pub role: Role,
    pub connection_state: ConnectionState,
    pub peer_present: bool,
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(room_id: impl Into<String>, role: Role) -> Self {
        Self {
            room_id: room_id.into(),
            role,
            connection_state: ConnectionState::Disconnected,
            peer_present: false,
            last_error: None,
        }
    }

    pub fn presence(&self) -> PeerPresence {
        if self.peer_present {
            PeerPresence::PeerReady
        } else {
            PeerPresence::WaitingForPeer
        }
    }

    /// Connected with the peer in the room; the only state that allows sends
    pub fn is_ready(&self) -> bool {
        self.connection_state == ConnectionState::Connected && self.peer_present
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.connection_state,
            ConnectionState::Disconnected | ConnectionState::Error
        )
    }

    /// Apply `connected`, `peer_joined` or `peer_left`
    ///
    /// Other messages and presence reports about our own role leave the
    /// session unchanged.
    pub fn apply_presence(&mut self, msg: &WireMessage) -> Option<PresenceChange> {
        let peer = self.role.peer();
        match msg {
            WireMessage::Connected {
                sender_connected,
                receiver_connected,
            } => {
                if self.connection_state == ConnectionState::Connecting {
                    self.connection_state = ConnectionState::Connected;
                }
                let peer_flag = match peer {
                    Role::Sender => *sender_connected,
                    Role::Receiver => *receiver_connected,
                };
                match peer_flag {
                    Some(true) if !self.peer_present => {
                        self.peer_present = true;
                        Some(PresenceChange::Joined(peer))
                    }
                    _ => None,
                }
            }
            WireMessage::PeerJoined { peer: joined } if *joined == peer => {
                if self.peer_present {
                    return None;
                }
                self.peer_present = true;
                Some(PresenceChange::Joined(peer))
            }
            WireMessage::PeerLeft { peer: left } if *left == peer => {
                if !self.peer_present {
                    return None;
                }
                self.peer_present = false;
                Some(PresenceChange::Left(peer))
            }
            _ => None,
        }
    }
}
