//! Destinations for completed incoming files

use anyhow::{Context, Result};
use bytes::Bytes;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::transfer::utils::{open_secure_file, sanitize_file_name};

/// Accepts a completed byte sequence and a suggested name
pub trait FileSink: Send + Sync + 'static {
    /// Store one file; returns where it landed, if on disk
    fn deliver(
        &mut self,
        name: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<Option<PathBuf>>> + Send;
}

/// Writes files into a download directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

impl FileSink for DirectorySink {
    async fn deliver(&mut self, name: &str, data: Bytes) -> Result<Option<PathBuf>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.dir.join(sanitize_file_name(name));
        let mut file = open_secure_file(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(&data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.flush().await?;

        info!("Saved {} to {}", name, path.display());
        Ok(Some(path))
    }
}

/// Keeps completed files in memory; clones share the same store
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<(String, Bytes)> {
        match self.files.lock() {
            Ok(files) => files.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl FileSink for MemorySink {
    async fn deliver(&mut self, name: &str, data: Bytes) -> Result<Option<PathBuf>> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink lock poisoned"))?;
        files.push((name.to_string(), data));
        Ok(None)
    }
}
