use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::transfer::TransferSettings;
use crate::transfer::constants::{CHUNK_SIZE, MAX_CHUNK_SIZE, PROGRESS_INTERVAL};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "datadrop";
const APP_NAME: &str = "datadrop";
const CONFIG_FILE: &str = "config.json";

/// Overrides the directory holding `config.json`
pub const CONFIG_DIR_ENV: &str = "DATADROP_CONFIG_DIR";
/// Overrides `relay_url`; also read from `.env`
pub const RELAY_URL_ENV: &str = "DATADROP_RELAY_URL";

pub const DEFAULT_RELAY_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub relay_url: String,
    pub download_path: PathBuf,
    pub chunk_size: usize,
    pub progress_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            download_path: get_download_dir(),
            chunk_size: CHUNK_SIZE,
            progress_interval_ms: PROGRESS_INTERVAL.as_millis() as u64,
        }
    }
}

impl ClientConfig {
    /// Load from the config directory, then apply environment overrides
    pub fn load() -> Self {
        // a missing .env is the normal case
        let _ = dotenvy::dotenv();

        let mut config = match get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        };
        config.apply_relay_override(std::env::var(RELAY_URL_ENV).ok());
        config
    }

    /// Read `path`; a missing or unreadable file yields the defaults
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                debug!("No config at {}, using defaults", path.display());
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring invalid config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = get_config_path().context("No config directory available")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn apply_relay_override(&mut self, relay_url: Option<String>) {
        if let Some(url) = relay_url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()) {
            debug!("Relay URL overridden from environment: {}", url);
            self.relay_url = url;
        }
    }

    /// Engine settings; zero values fall back to the defaults and the chunk
    /// size is capped at [`MAX_CHUNK_SIZE`]
    pub fn transfer_settings(&self) -> TransferSettings {
        let defaults = TransferSettings::default();
        let chunk_size = match self.chunk_size {
            0 => defaults.chunk_size,
            size if size > MAX_CHUNK_SIZE => {
                warn!(
                    "chunk_size {} exceeds the relay limit, using {}",
                    size, MAX_CHUNK_SIZE
                );
                MAX_CHUNK_SIZE
            }
            size => size,
        };
        TransferSettings {
            chunk_size,
            progress_interval: if self.progress_interval_ms == 0 {
                defaults.progress_interval
            } else {
                Duration::from_millis(self.progress_interval_ms)
            },
        }
    }
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Downloads folder when the platform has one, else ~/datadrop
pub fn get_download_dir() -> PathBuf {
    let Some(dirs) = directories::UserDirs::new() else {
        return PathBuf::from(".").join("datadrop");
    };
    match dirs.download_dir() {
        Some(downloads) => downloads.join("datadrop"),
        None => dirs.home_dir().join("datadrop"),
    }
}
