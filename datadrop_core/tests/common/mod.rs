#![allow(dead_code)]

//! Test relay that behaves like the DataDrop room server, plus helpers for
//! driving sessions and collecting their events.

use bytes::Bytes;
use datadrop_core::protocol::Frame;
use datadrop_core::{Link, LinkEvent, Role, SessionEvent};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum RoomEvent {
    Join {
        id: u64,
        role: Role,
        tx: mpsc::Sender<Frame>,
    },
    Inbound {
        id: u64,
        role: Role,
        event: LinkEvent,
    },
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

struct Stats {
    filename: String,
    total_size: u64,
    transferred: u64,
    start: Instant,
}

/// One room of the relay, run as a task
#[derive(Clone)]
pub struct Relay {
    room_id: String,
    events: mpsc::Sender<RoomEvent>,
    next_id: Arc<Mutex<u64>>,
    log: Arc<Mutex<Vec<(Role, Frame)>>>,
}

impl Relay {
    pub fn start(room_id: &str) -> Self {
        let (events, rx) = mpsc::channel(256);
        let log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(run_room(room_id.to_string(), rx, log.clone()));
        Self {
            room_id: room_id.to_string(),
            events,
            next_id: Arc::new(Mutex::new(0)),
            log,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// In-memory connection to the room
    pub async fn connect(&self, role: Role) -> Link {
        let (client, server) = Link::pair(64);
        self.attach(role, server.tx, server.rx).await;
        client
    }

    /// Register a connection: `tx` reaches the client, `rx` is what it sends
    pub async fn attach(
        &self,
        role: Role,
        tx: mpsc::Sender<Frame>,
        mut rx: mpsc::Receiver<LinkEvent>,
    ) {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.events
            .send(RoomEvent::Join { id, role, tx })
            .await
            .unwrap();

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let terminal = !matches!(event, LinkEvent::Frame(_));
                if events
                    .send(RoomEvent::Inbound { id, role, event })
                    .await
                    .is_err()
                    || terminal
                {
                    return;
                }
            }
            let _ = events
                .send(RoomEvent::Inbound {
                    id,
                    role,
                    event: LinkEvent::Closed,
                })
                .await;
        });
    }

    /// Every frame the relay received, in order
    pub fn received(&self) -> Vec<(Role, Frame)> {
        self.log.lock().unwrap().clone()
    }

    pub fn control_types_from(&self, role: Role) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|(r, _)| *r == role)
            .filter_map(|(_, frame)| match frame {
                Frame::Text(text) => serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(str::to_string)),
                Frame::Binary(_) => None,
            })
            .collect()
    }
}

fn text(value: Value) -> Frame {
    Frame::Text(value.to_string())
}

async fn send_to(slot: &Option<Slot>, frame: Frame) {
    if let Some(slot) = slot {
        let _ = slot.tx.send(frame).await;
    }
}

fn format_size(bytes: u64) -> String {
    datadrop_core::progress::format_size(bytes)
}

async fn run_room(
    room_id: String,
    mut events: mpsc::Receiver<RoomEvent>,
    log: Arc<Mutex<Vec<(Role, Frame)>>>,
) {
    let mut sender: Option<Slot> = None;
    let mut receiver: Option<Slot> = None;
    let mut stats: Option<Stats> = None;

    while let Some(event) = events.recv().await {
        match event {
            RoomEvent::Join { id, role, tx } => {
                let (own, other) = match role {
                    Role::Sender => (&mut sender, &receiver),
                    Role::Receiver => (&mut receiver, &sender),
                };
                if own.is_some() {
                    let name = match role {
                        Role::Sender => "Sender",
                        Role::Receiver => "Receiver",
                    };
                    // dropping tx closes the connection
                    let _ = tx
                        .send(text(json!({
                            "type": "error",
                            "message": format!("{} already connected", name),
                        })))
                        .await;
                    continue;
                }

                let peer_flag = match role {
                    Role::Sender => "receiver_connected",
                    Role::Receiver => "sender_connected",
                };
                let mut connected = json!({
                    "type": "connected",
                    "role": role.as_str(),
                    "room_id": room_id,
                    "message": format!("Connected as {}", role),
                });
                connected[peer_flag] = json!(other.is_some());
                let _ = tx.send(text(connected)).await;

                send_to(
                    other,
                    text(json!({
                        "type": "peer_joined",
                        "peer": role.as_str(),
                        "message": format!("{} connected", role),
                    })),
                )
                .await;
                *own = Some(Slot { id, tx });
            }
            RoomEvent::Inbound { id, role, event } => {
                let current = match role {
                    Role::Sender => sender.as_ref().map(|s| s.id),
                    Role::Receiver => receiver.as_ref().map(|s| s.id),
                };
                if current != Some(id) {
                    continue;
                }

                match event {
                    LinkEvent::Frame(frame) => {
                        log.lock().unwrap().push((role, frame.clone()));
                        match frame {
                            Frame::Text(raw) => {
                                let Ok(msg) = serde_json::from_str::<Value>(&raw) else {
                                    continue;
                                };
                                handle_message(role, &msg, &sender, &receiver, &mut stats).await;
                            }
                            Frame::Binary(chunk) => {
                                handle_chunk(role, chunk, &sender, &receiver, &mut stats).await;
                            }
                        }
                    }
                    LinkEvent::Closed | LinkEvent::Failed(_) => {
                        let other = match role {
                            Role::Sender => {
                                sender = None;
                                &receiver
                            }
                            Role::Receiver => {
                                receiver = None;
                                &sender
                            }
                        };
                        send_to(
                            other,
                            text(json!({
                                "type": "peer_left",
                                "peer": role.as_str(),
                                "message": format!("{} disconnected", role),
                            })),
                        )
                        .await;
                    }
                }
            }
        }
    }
}

async fn handle_message(
    role: Role,
    msg: &Value,
    sender: &Option<Slot>,
    receiver: &Option<Slot>,
    stats: &mut Option<Stats>,
) {
    match msg["type"].as_str() {
        Some("file_info") if role == Role::Sender => {
            let filename = msg["name"].as_str().unwrap_or("unknown").to_string();
            let total_size = msg["size"].as_u64().unwrap_or(0);
            send_to(
                receiver,
                text(json!({
                    "type": "file_info",
                    "name": filename,
                    "size": total_size,
                    "size_formatted": format_size(total_size),
                })),
            )
            .await;
            send_to(
                sender,
                text(json!({
                    "type": "transfer_started",
                    "message": format!("Starting transfer of {}", filename),
                })),
            )
            .await;
            *stats = Some(Stats {
                filename,
                total_size,
                transferred: 0,
                start: Instant::now(),
            });
        }
        Some("complete") if role == Role::Sender => {
            let (filename, size) = stats
                .as_ref()
                .map(|s| (s.filename.clone(), s.total_size))
                .unwrap_or_default();
            let complete = json!({
                "type": "complete",
                "filename": filename,
                "size": size,
                "size_formatted": format_size(size),
                "elapsed": "0s",
                "average_speed": "1.00 KB/s",
            });
            send_to(sender, text(complete.clone())).await;
            send_to(receiver, text(complete)).await;
        }
        Some("cancel") => {
            let cancelled = json!({
                "type": "cancelled",
                "message": format!("Transfer cancelled by {}", role),
            });
            send_to(sender, text(cancelled.clone())).await;
            send_to(receiver, text(cancelled)).await;
        }
        Some("ping") => {
            let own = match role {
                Role::Sender => sender,
                Role::Receiver => receiver,
            };
            send_to(own, text(json!({"type": "pong"}))).await;
        }
        _ => {}
    }
}

async fn handle_chunk(
    role: Role,
    chunk: Bytes,
    sender: &Option<Slot>,
    receiver: &Option<Slot>,
    stats: &mut Option<Stats>,
) {
    if role != Role::Sender || receiver.is_none() {
        return;
    }
    let len = chunk.len() as u64;
    send_to(receiver, Frame::Binary(chunk)).await;

    let Some(stats) = stats.as_mut() else {
        return;
    };
    stats.transferred += len;
    let elapsed = stats.start.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 {
        stats.transferred as f64 / elapsed
    } else {
        0.0
    };
    let progress = if stats.total_size > 0 {
        (stats.transferred as f64 / stats.total_size as f64 * 100.0 * 100.0).round() / 100.0
    } else {
        0.0
    };
    let msg = json!({
        "type": "progress",
        "filename": stats.filename,
        "total_size": stats.total_size,
        "transferred": stats.transferred,
        "progress": progress,
        "speed": speed,
        "speed_formatted": format!("{}/s", format_size(speed as u64)),
        "eta": "calculating...",
        "elapsed": "0s",
    });
    send_to(sender, text(msg.clone())).await;
    send_to(receiver, text(msg)).await;
}

/// Far end of a session's link, driven by the test itself
pub struct ScriptedRelay {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<LinkEvent>,
}

impl ScriptedRelay {
    /// Returns the relay end and the link to hand to the session
    pub fn pair() -> (ScriptedRelay, Link) {
        let (client, server) = Link::pair(64);
        (
            ScriptedRelay {
                tx: server.tx,
                rx: server.rx,
            },
            client,
        )
    }

    pub async fn send_json(&self, value: Value) {
        self.tx.send(text(value)).await.unwrap();
    }

    pub async fn send_raw(&self, raw: &str) {
        self.tx.send(Frame::Text(raw.to_string())).await.unwrap();
    }

    pub async fn send_binary(&self, data: &[u8]) {
        self.tx
            .send(Frame::Binary(Bytes::copy_from_slice(data)))
            .await
            .unwrap();
    }

    /// Next frame from the session, skipping nothing
    pub async fn next_frame(&mut self) -> Option<Frame> {
        match tokio::time::timeout(EVENT_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
        {
            Some(LinkEvent::Frame(frame)) => Some(frame),
            _ => None,
        }
    }
}

pub fn frame_type(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Text(raw) => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| v["type"].as_str().map(str::to_string)),
        Frame::Binary(_) => None,
    }
}

pub async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

/// Collect events until `done` matches; the matching event is the last one
pub async fn collect_until<F>(
    events: &mut mpsc::Receiver<SessionEvent>,
    mut done: F,
) -> Vec<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}
