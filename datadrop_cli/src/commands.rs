//! Command definitions and handlers

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use datadrop_core::config::{RELAY_URL_ENV, get_config_path};
use datadrop_core::relay::normalize_room_id;
use datadrop_core::{
    ClientConfig, DirectorySink, FileSource, MemorySink, QueueState, RelayClient, Role,
    SessionEvent, SessionHandle, SessionManager,
};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::output::EventPrinter;

const EVENT_CAPACITY: usize = 1000;

/// DataDrop - send files to another device through a relay room
#[derive(Parser)]
#[command(name = "datadrop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Relay base URL, overrides the saved config
    #[arg(long, global = true, env = RELAY_URL_ENV)]
    pub relay: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what the relay reports about itself
    Info,

    /// Send files into a room
    Send(SendArgs),

    /// Receive files from a room
    Receive(ReceiveArgs),

    /// Show or change the saved configuration
    Config(ConfigArgs),
}

#[derive(Parser)]
pub struct SendArgs {
    /// Room code; a new room is created when omitted
    #[arg(short, long)]
    pub room: Option<String>,

    /// Files to send, in order
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Parser)]
pub struct ReceiveArgs {
    /// Room code shared by the sender
    #[arg(short, long)]
    pub room: String,

    /// Output directory for received files
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

#[derive(Parser)]
pub struct ConfigArgs {
    /// Save a new relay base URL
    #[arg(long)]
    pub relay_url: Option<String>,

    /// Save a new download directory
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
}

pub async fn info(config: &ClientConfig) -> Result<()> {
    let client = RelayClient::new(&config.relay_url)?;
    let info = client.server_info().await?;

    println!("Relay:      {}", client.base_url());
    println!("Address:    {}:{}", info.ip, info.port);
    println!("API:        {}", info.url);
    println!("Web app:    {}", info.frontend_url);
    println!("WebSocket:  {}", info.websocket);
    Ok(())
}

pub async fn send(config: &ClientConfig, args: SendArgs) -> Result<()> {
    let client = RelayClient::new(&config.relay_url)?;

    // open everything up front so a bad path fails before anyone joins
    let mut sources = Vec::with_capacity(args.files.len());
    for path in &args.files {
        sources.push(FileSource::open(path).await?);
    }

    let room_id = match args.room {
        Some(room) => normalize_room_id(&room)?,
        None => {
            let room = client.create_room().await?;
            println!("Room code: {}", room.room_id);
            println!("Join at:   {}", room.join_url);
            room.room_id
        }
    };

    let (events_tx, mut events) = mpsc::channel(EVENT_CAPACITY);
    let handle = SessionManager::connect(
        &client,
        &room_id,
        Role::Sender,
        MemorySink::new(),
        config.transfer_settings(),
        events_tx,
    )
    .await?;

    println!("Waiting for the receiver to join room {}...", room_id);
    if !wait_for_peer(&handle).await? {
        return Ok(());
    }

    handle.send_files(sources).await?;
    spawn_cancel_on_ctrl_c(handle.clone());

    let mut printer = EventPrinter::new(Role::Sender);
    let summary = loop {
        let Some(event) = events.recv().await else {
            bail!("Session ended before the transfer finished");
        };
        printer.print(&event);
        if let SessionEvent::QueueFinished(summary) = event {
            break summary;
        }
    };

    handle.disconnect().await.ok();
    handle.closed().await;

    match summary.state {
        QueueState::Cancelled => bail!("Transfer cancelled"),
        _ if summary.failed_files > 0 => bail!(
            "{} of {} files failed",
            summary.failed_files,
            summary.tasks.len()
        ),
        _ => Ok(()),
    }
}

pub async fn receive(config: &ClientConfig, args: ReceiveArgs) -> Result<()> {
    let client = RelayClient::new(&config.relay_url)?;
    let room_id = normalize_room_id(&args.room)?;
    let out = args.out.unwrap_or_else(|| config.download_path.clone());
    tokio::fs::create_dir_all(&out)
        .await
        .with_context(|| format!("Failed to create {}", out.display()))?;

    let (events_tx, mut events) = mpsc::channel(EVENT_CAPACITY);
    let handle = SessionManager::connect(
        &client,
        &room_id,
        Role::Receiver,
        DirectorySink::new(&out),
        config.transfer_settings(),
        events_tx,
    )
    .await?;
    println!(
        "Joined room {}; files will be saved to {}",
        room_id,
        out.display()
    );

    let mut printer = EventPrinter::new(Role::Receiver);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                printer.print(&event);
                if matches!(event, SessionEvent::PeerLeft(_)) || printer.session_error().is_some() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving room");
                handle.cancel().await.ok();
                break;
            }
        }
    }

    handle.disconnect().await.ok();
    handle.closed().await;
    // flush what the session reported before it stopped
    while let Ok(event) = events.try_recv() {
        printer.print(&event);
    }
    printer.finish();

    println!(
        "Received {} file(s), {} failed",
        printer.completed(),
        printer.failed()
    );
    if let Some(reason) = printer.session_error() {
        bail!("Session failed: {}", reason);
    }
    Ok(())
}

pub fn config(args: ConfigArgs) -> Result<()> {
    let path = get_config_path().context("No config directory available")?;
    // the saved file, without environment overrides
    let mut config = ClientConfig::load_from(&path);

    let mut changed = false;
    if let Some(url) = args.relay_url {
        RelayClient::new(&url)?;
        config.relay_url = url;
        changed = true;
    }
    if let Some(dir) = args.download_dir {
        config.download_path = dir;
        changed = true;
    }
    if changed {
        config.save_to(&path)?;
        println!("Saved {}", path.display());
    }

    println!("relay_url:            {}", config.relay_url);
    println!("download_path:        {}", config.download_path.display());
    println!("chunk_size:           {}", config.chunk_size);
    println!("progress_interval_ms: {}", config.progress_interval_ms);
    Ok(())
}

/// Wait until the receiver is present; false when the user gave up
async fn wait_for_peer(handle: &SessionHandle) -> Result<bool> {
    tokio::select! {
        ready = handle.wait_until_ready() => {
            ready?;
            Ok(true)
        }
        _ = tokio::signal::ctrl_c() => {
            debug!("Interrupted while waiting for the receiver");
            handle.disconnect().await.ok();
            handle.closed().await;
            Ok(false)
        }
    }
}

fn spawn_cancel_on_ctrl_c(handle: SessionHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling transfer");
            let _ = handle.cancel().await;
        }
    });
}
