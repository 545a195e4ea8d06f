//! The session task
//!
//! One task owns the relay link, the session state and the receive engine.
//! Handles, the send queue and the link all talk to it through channels, so
//! every piece of session state has a single writer.

use bytes::Bytes;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{ConnectionState, PresenceChange, Session};
use crate::SessionEvent;
use crate::error::{SessionError, TransferError};
use crate::link::{Link, LinkEvent, Outbound, OutboundLink};
use crate::progress::ProgressSnapshot;
use crate::protocol::{self, Frame, Role, WireMessage};
use crate::queue::{FileTask, QueueSummary, TransferQueue, run_queue};
use crate::sink::FileSink;
use crate::transfer::constants::CHANNEL_CAPACITY;
use crate::transfer::{ChunkOutcome, FileSource, ReceiveEngine, TransferSettings};

/// Requests from a [`SessionHandle`](super::SessionHandle)
#[derive(Debug)]
pub(crate) enum SessionCommand {
    SendFiles {
        sources: Vec<FileSource>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Cancel,
    Disconnect,
}

pub(crate) struct SessionActor<K: FileSink> {
    session: Session,
    settings: TransferSettings,
    link: Link,
    link_open: bool,
    commands: mpsc::Receiver<SessionCommand>,
    outbound: OutboundLink,
    outbound_rx: mpsc::Receiver<Outbound>,
    queue_done_tx: mpsc::Sender<QueueSummary>,
    queue_done_rx: mpsc::Receiver<QueueSummary>,
    events: mpsc::Sender<SessionEvent>,
    status_tx: watch::Sender<Session>,
    receiver: ReceiveEngine,
    inbox: TransferQueue,
    active_send: Option<CancellationToken>,
    /// Set once the session failed; later sends are refused with it
    fault: Option<SessionError>,
    sink: K,
}

impl<K: FileSink> SessionActor<K> {
    pub(crate) fn new(
        session: Session,
        link: Link,
        sink: K,
        settings: TransferSettings,
        commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Sender<SessionEvent>,
        status_tx: watch::Sender<Session>,
    ) -> Self {
        let (outbound, outbound_rx) = OutboundLink::channel(CHANNEL_CAPACITY);
        let (queue_done_tx, queue_done_rx) = mpsc::channel(1);
        Self {
            session,
            settings,
            link,
            link_open: true,
            commands,
            outbound,
            outbound_rx,
            queue_done_tx,
            queue_done_rx,
            events,
            status_tx,
            receiver: ReceiveEngine::new(settings),
            inbox: TransferQueue::new(),
            active_send: None,
            fault: None,
            sink,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            "Session started: room {} as {}",
            self.session.room_id, self.session.role
        );
        self.emit(SessionEvent::StateChanged(self.session.clone()))
            .await;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::SendFiles { sources, reply }) => {
                        let result = self.start_queue(sources);
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Cancel) => self.cancel_local().await,
                    // every handle dropped counts as a disconnect
                    Some(SessionCommand::Disconnect) | None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(request) = self.outbound_rx.recv() => self.write_outbound(request).await,
                event = self.link.rx.recv(), if self.link_open => match event {
                    Some(LinkEvent::Frame(frame)) => self.dispatch(frame).await,
                    Some(LinkEvent::Failed(e)) => self.channel_lost(Some(e.to_string())).await,
                    Some(LinkEvent::Closed) | None => self.channel_lost(None).await,
                },
                Some(summary) = self.queue_done_rx.recv() => {
                    self.active_send = None;
                    self.emit(SessionEvent::QueueFinished(summary)).await;
                }
            }
        }
        info!("Session closed: room {}", self.session.room_id);
    }

    fn is_streaming(&self) -> bool {
        self.receiver.is_streaming() || self.active_send.is_some()
    }

    /// Why an outgoing frame cannot be written right now, if it cannot
    fn send_blocker(&self) -> Option<SessionError> {
        if let Some(fault) = &self.fault {
            return Some(fault.clone());
        }
        if !self.link_open || self.session.connection_state != ConnectionState::Connected {
            return Some(SessionError::NotConnected);
        }
        if !self.session.peer_present {
            return Some(SessionError::PeerNotReady);
        }
        None
    }

    async fn write_outbound(&mut self, request: Outbound) {
        let Outbound { frame, ack } = request;
        // frames queued before a cancel must not follow it onto the wire
        let cancelled = self
            .active_send
            .as_ref()
            .is_some_and(|cancel| cancel.is_cancelled());
        let result = match self.send_blocker() {
            _ if cancelled => Err(SessionError::Cancelled),
            Some(e) => Err(e),
            None => self
                .link
                .tx
                .send(frame)
                .await
                .map_err(|_| SessionError::ChannelClosed),
        };
        match &result {
            Err(SessionError::Cancelled) => debug!("Dropping frame queued before cancel"),
            Err(e) => warn!("Refusing outgoing frame: {}", e),
            Ok(()) => {}
        }
        let _ = ack.send(result);
    }

    fn start_queue(&mut self, sources: Vec<FileSource>) -> Result<(), SessionError> {
        if self.session.role != Role::Sender {
            return Err(SessionError::WrongRole(Role::Sender));
        }
        if self.active_send.is_some() {
            return Err(SessionError::Busy);
        }
        if let Some(e) = self.send_blocker() {
            warn!("Cannot start sending: {}", e);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        self.active_send = Some(cancel.clone());

        let link = self.outbound.clone();
        let events = self.events.clone();
        let done = self.queue_done_tx.clone();
        let settings = self.settings;
        tokio::spawn(async move {
            let summary = run_queue(sources, link, cancel, events, settings).await;
            let _ = done.send(summary).await;
        });
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) {
        let text = match frame {
            Frame::Binary(data) => return self.on_chunk(data).await,
            Frame::Text(text) => text,
        };

        match protocol::decode_text(&text) {
            Ok(msg) => self.on_message(msg).await,
            Err(e) if e.is_unknown_type() => debug!("Ignoring control frame: {}", e),
            Err(e) => warn!("Dropping undecodable control frame: {}", e),
        }
    }

    async fn on_message(&mut self, msg: WireMessage) {
        let role = self.session.role;
        match msg {
            WireMessage::Connected { .. }
            | WireMessage::PeerJoined { .. }
            | WireMessage::PeerLeft { .. } => self.on_presence(&msg).await,
            WireMessage::FileInfo { name, size } if role == Role::Receiver => {
                self.on_file_info(name, size).await
            }
            WireMessage::Complete { .. } if role == Role::Receiver => self.on_complete().await,
            WireMessage::FileInfo { .. } | WireMessage::Complete { .. } => {
                debug!("Ignoring {} echoed to the sender", msg.type_name())
            }
            WireMessage::Progress {
                transferred,
                total_size,
                speed,
                percentage,
                ..
            } => {
                self.emit(SessionEvent::PeerProgress {
                    transferred,
                    total_size,
                    percentage,
                    speed,
                })
                .await
            }
            WireMessage::Cancel {} | WireMessage::Cancelled {} => self.on_remote_cancel().await,
            WireMessage::Error { message } => self.on_remote_error(message).await,
        }
    }

    async fn on_presence(&mut self, msg: &WireMessage) {
        let was_streaming = self.is_streaming();
        match self.session.apply_presence(msg) {
            Some(PresenceChange::Joined(peer)) => {
                info!("Peer joined room {}: {}", self.session.room_id, peer);
                self.emit(SessionEvent::PeerJoined(peer)).await;
            }
            Some(PresenceChange::Left(peer)) => {
                info!("Peer left room {}: {}", self.session.room_id, peer);
                self.emit(SessionEvent::PeerLeft(peer)).await;
                if was_streaming {
                    warn!("Peer left during a transfer, session cannot continue");
                    self.fault = Some(SessionError::PeerLeft);
                    self.session.connection_state = ConnectionState::Error;
                    self.session.last_error = Some(SessionError::PeerLeft.to_string());
                    self.fail_incoming(TransferError::Channel(SessionError::PeerLeft))
                        .await;
                }
            }
            None => {}
        }
        self.publish().await;
    }

    async fn on_file_info(&mut self, name: String, size: u64) {
        if self.receiver.is_streaming() {
            self.fail_incoming(TransferError::Unexpected(
                "file announcement before the previous file completed",
            ))
            .await;
        }

        let mime_hint = mime_guess::from_path(&name).first().map(|m| m.to_string());
        let index = self.inbox.push(FileTask::new(name.clone(), size, mime_hint));
        let Some(task) = self.inbox.begin(index).cloned() else {
            return;
        };
        self.emit(SessionEvent::FileStarted {
            task,
            is_sending: false,
        })
        .await;

        if let Err(e) = self.receiver.announce(&name, size, Instant::now()) {
            self.fail_incoming(e).await;
        }
    }

    async fn on_chunk(&mut self, data: Bytes) {
        match self.receiver.accept_chunk(&data, Instant::now()) {
            ChunkOutcome::Accepted(snapshot) => {
                self.inbox.record_progress(self.receiver.received_bytes());
                if let Some(progress) = snapshot {
                    self.report_incoming(progress).await;
                }
            }
            ChunkOutcome::Dropped => {}
            ChunkOutcome::Failed(e) => self.fail_incoming(e).await,
        }
    }

    async fn on_complete(&mut self) {
        let file = match self.receiver.complete(Instant::now()) {
            Ok(file) => file,
            Err(TransferError::Unexpected(what)) => {
                debug!("Ignoring {}", what);
                return;
            }
            Err(e) => {
                self.fail_incoming(e).await;
                return;
            }
        };

        self.inbox.record_progress(file.data.len() as u64);
        self.report_incoming(file.progress.clone()).await;

        let average_speed = file.average_speed;
        match self.sink.deliver(&file.name, file.data).await {
            Ok(saved_path) => {
                if let Some(task) = self.inbox.complete() {
                    self.emit(SessionEvent::FileCompleted {
                        task,
                        is_sending: false,
                        average_speed,
                        saved_path,
                    })
                    .await;
                }
            }
            Err(e) => {
                error!("Failed to store {}: {:#}", file.name, e);
                let error = TransferError::Sink(format!("{:#}", e)).to_string();
                if let Some(task) = self.inbox.fail(error.clone()) {
                    self.emit(SessionEvent::FileFailed {
                        task,
                        is_sending: false,
                        error,
                    })
                    .await;
                }
            }
        }
    }

    async fn on_remote_cancel(&mut self) {
        if let Some(cancel) = &self.active_send {
            info!("Peer cancelled the transfer");
            cancel.cancel();
        }
        self.cancel_incoming().await;
    }

    async fn on_remote_error(&mut self, message: String) {
        warn!("Relay reported an error: {}", message);
        self.session.last_error = Some(message.clone());
        self.publish().await;
        self.emit(SessionEvent::RemoteError(message.clone())).await;

        if self.receiver.is_streaming() {
            self.fail_incoming(TransferError::Remote(message)).await;
        }
    }

    /// User cancel: stop local work and tell the peer once
    async fn cancel_local(&mut self) {
        if let Some(cancel) = &self.active_send {
            info!("Cancelling outgoing queue");
            cancel.cancel();
        }
        self.cancel_incoming().await;
        self.forward_cancel().await;
    }

    /// Tell the peer, through the relay, that the transfer stopped
    async fn forward_cancel(&mut self) {
        if self.send_blocker().is_some() {
            debug!("Cancel not forwarded, session is not ready");
            return;
        }
        match protocol::encode(&WireMessage::Cancel {}) {
            Ok(frame) => {
                if self.link.tx.send(frame).await.is_err() {
                    warn!("Failed to forward cancel, relay channel closed");
                }
            }
            Err(e) => error!("Failed to encode cancel: {}", e),
        }
    }

    async fn cancel_incoming(&mut self) {
        if let Some(discarded) = self.receiver.abort(true) {
            info!(
                "Incoming file {} cancelled, discarded {} bytes",
                self.receiver.file_name(),
                discarded
            );
            if let Some(task) = self.inbox.cancel() {
                self.emit(SessionEvent::FileCancelled {
                    task,
                    is_sending: false,
                })
                .await;
            }
        }
    }

    /// Abort the incoming file (if any) and mark its task failed
    async fn fail_incoming(&mut self, error: TransferError) {
        self.receiver.abort(false);
        let message = error.to_string();
        if let Some(task) = self.inbox.fail(message.clone()) {
            warn!("Incoming file {} failed: {}", task.name, message);
            self.emit(SessionEvent::FileFailed {
                task,
                is_sending: false,
                error: message,
            })
            .await;
        }
    }

    async fn report_incoming(&self, progress: ProgressSnapshot) {
        let Some(task) = self.inbox.current() else {
            return;
        };
        self.emit(SessionEvent::TransferProgress {
            task_id: task.id,
            file_name: task.name.clone(),
            is_sending: false,
            progress,
            overall: self.inbox.overall(),
        })
        .await;
    }

    async fn channel_lost(&mut self, reason: Option<String>) {
        self.link_open = false;
        match &reason {
            Some(reason) => error!("Relay channel failed: {}", reason),
            None => info!("Relay channel closed"),
        }

        self.session.connection_state = ConnectionState::Error;
        self.session.peer_present = false;
        if let Some(reason) = reason {
            self.session.last_error = Some(reason);
        } else if self.session.last_error.is_none() {
            self.session.last_error = Some(SessionError::ChannelClosed.to_string());
        }
        self.fault.get_or_insert(SessionError::ChannelClosed);

        self.fail_incoming(TransferError::Channel(SessionError::ChannelClosed))
            .await;
        self.publish().await;
    }

    async fn shutdown(&mut self) {
        // a queue already cancelled has told the peer
        let interrupted = self.receiver.is_streaming()
            || self
                .active_send
                .as_ref()
                .is_some_and(|cancel| !cancel.is_cancelled());
        if let Some(cancel) = self.active_send.take() {
            cancel.cancel();
        }
        self.cancel_incoming().await;
        if interrupted {
            info!("Disconnecting mid-transfer, cancelling it for the peer");
            self.forward_cancel().await;
        }
        self.session.connection_state = ConnectionState::Disconnected;
        self.session.peer_present = false;
        self.publish().await;
    }

    /// Push the session to watchers; emits an event only on change
    async fn publish(&self) {
        let session = self.session.clone();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == session {
                false
            } else {
                *current = session.clone();
                true
            }
        });
        if changed {
            debug!(
                "Session state: {:?}, peer present: {}",
                self.session.connection_state, self.session.peer_present
            );
            self.emit(SessionEvent::StateChanged(self.session.clone()))
                .await;
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn ready_actor(role: Role) -> (SessionActor<MemorySink>, Link) {
        let (link, relay) = Link::pair(16);
        let mut session = Session::new("AB12CD", role);
        session.connection_state = ConnectionState::Connected;
        session.peer_present = true;
        let (_commands_tx, commands) = mpsc::channel(4);
        let (events, _) = mpsc::channel(64);
        let (status_tx, _) = watch::channel(session.clone());
        let actor = SessionActor::new(
            session,
            link,
            MemorySink::new(),
            TransferSettings::default(),
            commands,
            events,
            status_tx,
        );
        (actor, relay)
    }

    /// Drop the actor and list the control frames the relay got, in order
    async fn wire_types<K: FileSink>(actor: SessionActor<K>, mut relay: Link) -> Vec<&'static str> {
        drop(actor);
        let mut types = Vec::new();
        while let Some(LinkEvent::Frame(frame)) = relay.rx.recv().await {
            if let Ok(msg) = protocol::decode(&frame) {
                types.push(msg.type_name());
            }
        }
        types
    }

    /// Queue a frame the way the send engine does and return its ack
    async fn queued_write<K: FileSink>(
        actor: &mut SessionActor<K>,
        frame: Frame,
    ) -> Result<(), SessionError> {
        let (ack, done) = oneshot::channel();
        actor.write_outbound(Outbound { frame, ack }).await;
        done.await.unwrap()
    }

    #[tokio::test]
    async fn test_no_frame_follows_local_cancel() {
        let (mut actor, relay) = ready_actor(Role::Sender);
        actor.active_send = Some(CancellationToken::new());

        actor.cancel_local().await;
        let complete = protocol::encode(&WireMessage::Complete {
            average_speed: Some(1.0),
        })
        .unwrap();
        assert_eq!(
            queued_write(&mut actor, complete).await,
            Err(SessionError::Cancelled)
        );
        assert_eq!(
            queued_write(&mut actor, Frame::Binary(Bytes::from_static(b"late"))).await,
            Err(SessionError::Cancelled)
        );

        assert_eq!(wire_types(actor, relay).await, vec!["cancel"]);
    }

    #[tokio::test]
    async fn test_disconnect_mid_queue_cancels_for_peer() {
        let (mut actor, relay) = ready_actor(Role::Sender);
        let cancel = CancellationToken::new();
        actor.active_send = Some(cancel.clone());

        actor.shutdown().await;
        assert!(cancel.is_cancelled());
        assert_eq!(
            actor.session.connection_state,
            ConnectionState::Disconnected
        );
        assert_eq!(wire_types(actor, relay).await, vec!["cancel"]);
    }

    #[tokio::test]
    async fn test_disconnect_after_cancel_sends_nothing_more() {
        let (mut actor, relay) = ready_actor(Role::Sender);
        let cancel = CancellationToken::new();
        cancel.cancel();
        actor.active_send = Some(cancel);

        actor.shutdown().await;
        assert!(wire_types(actor, relay).await.is_empty());
    }

    #[tokio::test]
    async fn test_idle_disconnect_sends_nothing() {
        let (mut actor, relay) = ready_actor(Role::Receiver);

        actor.shutdown().await;
        assert!(wire_types(actor, relay).await.is_empty());
    }
}
