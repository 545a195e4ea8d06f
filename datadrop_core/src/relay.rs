//! HTTP side of the relay: discovery, room creation and WebSocket addresses

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::protocol::Role;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Length of the room codes the relay hands out
pub const ROOM_ID_LENGTH: usize = 6;

/// Answer of `GET /server-info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub ip: String,
    pub port: u16,
    pub frontend_port: u16,
    pub url: String,
    pub frontend_url: String,
    pub websocket: String,
}

/// Answer of `POST /create-room`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub join_url: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    base: Url,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("Invalid relay URL: {}", base_url))?;
        if !matches!(base.scheme(), "http" | "https") {
            bail!("Relay URL must use http or https, got {}", base.scheme());
        }

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { base, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        let url = self.endpoint(&["server-info"])?;
        debug!("GET {}", url);
        let info = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to reach relay")?
            .error_for_status()
            .context("Relay rejected server-info request")?
            .json::<ServerInfo>()
            .await
            .context("Invalid server-info response")?;
        Ok(info)
    }

    pub async fn create_room(&self) -> Result<RoomInfo> {
        let url = self.endpoint(&["create-room"])?;
        debug!("POST {}", url);
        let room = self
            .http
            .post(url)
            .send()
            .await
            .context("Failed to reach relay")?
            .error_for_status()
            .context("Relay rejected create-room request")?
            .json::<RoomInfo>()
            .await
            .context("Invalid create-room response")?;
        info!("Created room {}", room.room_id);
        Ok(room)
    }

    /// `ws(s)://<relay>/ws/{room_id}/{role}`
    pub fn websocket_url(&self, room_id: &str, role: Role) -> Result<Url> {
        let mut url = self.endpoint(&["ws", room_id, role.as_str()])?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("Cannot derive a WebSocket URL from {}", self.base))?;
        Ok(url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| anyhow!("Relay URL cannot have a path: {}", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Normalize a room code typed by a user ("ab12cd " -> "AB12CD")
pub fn normalize_room_id(input: &str) -> Result<String> {
    let room_id = input.trim().to_ascii_uppercase();
    if room_id.is_empty() {
        bail!("Room code is empty");
    }
    if !room_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("Room code must be letters and digits only: {}", input.trim());
    }
    Ok(room_id)
}
