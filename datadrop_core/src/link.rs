//! Ordered duplex channel to the relay
//!
//! A [`Link`] is a pair of tokio channels: frames pushed into `tx` reach the
//! relay in order, and `rx` yields what the relay sends back followed by one
//! terminal event. The WebSocket implementation runs two pump tasks; the
//! in-memory pair is used by hosts that embed a relay and by tests.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};
use url::Url;

use crate::error::{SessionError, TransportError};
use crate::protocol::Frame;

/// What the reading half of a link produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(Frame),
    /// The far end closed the channel
    Closed,
    /// Transport failure; no further events follow
    Failed(TransportError),
}

pub struct Link {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<LinkEvent>,
}

impl Link {
    /// Two links wired back to back
    ///
    /// Dropping one side's `tx` delivers [`LinkEvent::Closed`] to the other.
    /// Must be called from within a tokio runtime.
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_out) = mpsc::channel(capacity);
        let (b_tx, b_out) = mpsc::channel(capacity);
        let (a_in_tx, a_rx) = mpsc::channel(capacity);
        let (b_in_tx, b_rx) = mpsc::channel(capacity);

        tokio::spawn(forward(a_out, b_in_tx));
        tokio::spawn(forward(b_out, a_in_tx));

        (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
    }
}

async fn forward(mut from: mpsc::Receiver<Frame>, to: mpsc::Sender<LinkEvent>) {
    while let Some(frame) = from.recv().await {
        if to.send(LinkEvent::Frame(frame)).await.is_err() {
            return;
        }
    }
    let _ = to.send(LinkEvent::Closed).await;
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
        }
    }
}

/// Open a WebSocket to the relay and bridge it to a [`Link`]
pub async fn connect_websocket(url: &Url, capacity: usize) -> Result<Link, TransportError> {
    info!("Connecting to relay: {}", url);
    // wss relays need a process-wide provider; a second install is a no-op
    let _ = rustls::crypto::ring::default_provider().install_default();
    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(capacity);
    let (write_failed_tx, mut write_failed_rx) = oneshot::channel::<TransportError>();

    // Writer pump: drains the link until the owner drops it, then closes
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(frame.into()).await {
                error!("Failed to write frame to relay: {}", e);
                let _ = write_failed_tx.send(TransportError::WebSocket(e.to_string()));
                return;
            }
        }
        debug!("Link dropped, closing WebSocket");
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    });

    // Reader pump: forwards frames and reports exactly one terminal event
    tokio::spawn(async move {
        let mut writer_running = true;
        let terminal = loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(LinkEvent::Frame(Frame::Text(text.as_str().to_owned()))).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if in_tx.send(LinkEvent::Frame(Frame::Binary(data))).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Relay closed the WebSocket: {:?}", frame);
                        break LinkEvent::Closed;
                    }
                    // Ping/Pong are answered by tungstenite itself
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("WebSocket read error: {}", e);
                        break LinkEvent::Failed(TransportError::WebSocket(e.to_string()));
                    }
                    None => break LinkEvent::Closed,
                },
                res = &mut write_failed_rx, if writer_running => match res {
                    Ok(e) => break LinkEvent::Failed(e),
                    // writer finished normally
                    Err(_) => writer_running = false,
                },
            }
        };
        let _ = in_tx.send(terminal).await;
    });

    Ok(Link {
        tx: out_tx,
        rx: in_rx,
    })
}

/// A frame waiting to be written, answered once the session accepted or
/// rejected it
#[derive(Debug)]
pub struct Outbound {
    pub frame: Frame,
    pub ack: oneshot::Sender<Result<(), SessionError>>,
}

/// Handle the transfer engine writes through
///
/// Every frame is a request to the session task; the returned future
/// resolves once the session has written the frame or refused it.
#[derive(Debug, Clone)]
pub struct OutboundLink {
    tx: mpsc::Sender<Outbound>,
}

impl OutboundLink {
    pub fn channel(capacity: usize) -> (OutboundLink, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (OutboundLink { tx }, rx)
    }

    pub async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Outbound { frame, ack })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        done.await.map_err(|_| SessionError::ChannelClosed)?
    }
}
