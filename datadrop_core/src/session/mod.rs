//! Session lifecycle: relay link, peer presence and message dispatch
//!
//! [`SessionManager`] spawns the session task and returns a [`SessionHandle`].
//! The host must keep draining the event channel it passed in; the session
//! waits on it when the channel is full.

mod manager;
pub mod state;

pub use state::{ConnectionState, PeerPresence, PresenceChange, Session};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

use crate::SessionEvent;
use crate::error::SessionError;
use crate::link::{Link, connect_websocket};
use crate::protocol::Role;
use crate::relay::RelayClient;
use crate::sink::FileSink;
use crate::transfer::constants::CHANNEL_CAPACITY;
use crate::transfer::{FileSource, TransferSettings};
use manager::{SessionActor, SessionCommand};

/// Cloneable handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<Session>,
}

impl SessionHandle {
    /// Latest session snapshot
    pub fn status(&self) -> Session {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.status.clone()
    }

    /// Resolves once connected with the peer present, or fails if the
    /// session ends first
    pub async fn wait_until_ready(&self) -> Result<(), SessionError> {
        let mut status = self.status.clone();
        let session = status
            .wait_for(|s| s.is_ready() || s.is_terminal())
            .await
            .map_err(|_| SessionError::ChannelClosed)?
            .clone();

        if session.is_ready() {
            return Ok(());
        }
        match session.connection_state {
            ConnectionState::Disconnected => Err(SessionError::NotConnected),
            _ => Err(SessionError::Connect(
                session
                    .last_error
                    .unwrap_or_else(|| SessionError::ChannelClosed.to_string()),
            )),
        }
    }

    /// Queue files for sending; fails right away if the session cannot send
    pub async fn send_files(&self, sources: Vec<FileSource>) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::SendFiles { sources, reply })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        response.await.map_err(|_| SessionError::ChannelClosed)?
    }

    pub async fn cancel(&self) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::Cancel)
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::Disconnect)
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Resolves when the session task has exited
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

pub struct SessionManager;

impl SessionManager {
    /// Join `room_id` on the relay as `role`
    pub async fn connect<K: FileSink>(
        relay: &RelayClient,
        room_id: &str,
        role: Role,
        sink: K,
        settings: TransferSettings,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<SessionHandle, SessionError> {
        let url = relay
            .websocket_url(room_id, role)
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        let link = connect_websocket(&url, CHANNEL_CAPACITY)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        info!("Connected to relay room {} as {}", room_id, role);

        Ok(Self::spawn_with_link(
            Session::new(room_id, role),
            link,
            sink,
            settings,
            events,
        ))
    }

    /// Run a session over an already established link
    pub fn spawn_with_link<K: FileSink>(
        mut session: Session,
        link: Link,
        sink: K,
        settings: TransferSettings,
        events: mpsc::Sender<SessionEvent>,
    ) -> SessionHandle {
        session.connection_state = ConnectionState::Connecting;
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(session.clone());

        let actor = SessionActor::new(
            session,
            link,
            sink,
            settings,
            commands_rx,
            events,
            status_tx,
        );
        tokio::spawn(actor.run());

        SessionHandle {
            commands: commands_tx,
            status: status_rx,
        }
    }
}
