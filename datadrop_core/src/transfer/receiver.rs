use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::utils::validate_transfer_info;
use super::{EngineState, TransferSettings};
use crate::error::TransferError;
use crate::progress::{ProgressSnapshot, ProgressTracker, format_size};

/// Upper bound for the buffer reserved up front; larger files grow on demand
const INITIAL_BUFFER_LIMIT: u64 = 64 * 1024 * 1024;

/// Result of feeding one binary frame to the engine
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Appended; carries a snapshot when a progress event is due
    Accepted(Option<ProgressSnapshot>),
    /// No file is streaming, the frame was discarded
    Dropped,
    Failed(TransferError),
}

/// A fully reassembled file
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub data: Bytes,
    pub average_speed: f64,
    pub progress: ProgressSnapshot,
}

/// Rebuilds incoming files from `file_info`, binary frames and `complete`
///
/// Chunks carry no header, so bytes are appended strictly in arrival order.
#[derive(Debug)]
pub struct ReceiveEngine {
    state: EngineState,
    file_name: String,
    expected: u64,
    buffer: BytesMut,
    tracker: Option<ProgressTracker>,
    last_report: Option<Instant>,
    progress_interval: Duration,
    dropped_frames: u64,
}

impl ReceiveEngine {
    pub fn new(settings: TransferSettings) -> Self {
        Self {
            state: EngineState::Idle,
            file_name: String::new(),
            expected: 0,
            buffer: BytesMut::new(),
            tracker: None,
            last_report: None,
            progress_interval: settings.progress_interval,
            dropped_frames: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == EngineState::Streaming
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn received_bytes(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Binary frames that arrived while no file was streaming
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Start a new file, discarding whatever was buffered before
    pub fn announce(&mut self, name: &str, size: u64, now: Instant) -> Result<(), TransferError> {
        if self.is_streaming() {
            warn!(
                "New file announced while {} was streaming, discarding {} bytes",
                self.file_name,
                self.buffer.len()
            );
        }
        self.buffer = BytesMut::new();
        self.tracker = None;
        self.last_report = None;
        self.file_name = name.to_string();
        self.expected = size;

        if let Err(e) = validate_transfer_info(name, size) {
            warn!("Rejecting announced file {}: {}", name, e);
            self.state = EngineState::Failed;
            return Err(e);
        }
        self.state = EngineState::Announced;

        self.buffer.reserve(size.min(INITIAL_BUFFER_LIMIT) as usize);
        self.tracker = Some(ProgressTracker::new(size, now));
        self.state = EngineState::Streaming;
        info!("Receiving file: {} ({})", name, format_size(size));
        Ok(())
    }

    pub fn accept_chunk(&mut self, data: &[u8], now: Instant) -> ChunkOutcome {
        if !self.is_streaming() {
            self.dropped_frames += 1;
            debug!(
                "Dropping {} byte binary frame, no file is streaming",
                data.len()
            );
            return ChunkOutcome::Dropped;
        }

        let received = self.buffer.len() as u64 + data.len() as u64;
        if received > self.expected {
            warn!(
                "{} overflowed: {} bytes received, {} announced",
                self.file_name, received, self.expected
            );
            self.discard(EngineState::Failed);
            return ChunkOutcome::Failed(TransferError::SizeMismatch {
                expected: self.expected,
                received,
            });
        }
        self.buffer.extend_from_slice(data);

        let due = self
            .last_report
            .map(|at| now.saturating_duration_since(at) >= self.progress_interval)
            .unwrap_or(true);
        let snapshot = match self.tracker.as_mut() {
            Some(tracker) if due && received < self.expected => {
                self.last_report = Some(now);
                Some(tracker.sample(now, received))
            }
            _ => None,
        };
        ChunkOutcome::Accepted(snapshot)
    }

    /// Finish the streaming file; fails unless exactly the announced bytes arrived
    pub fn complete(&mut self, now: Instant) -> Result<ReceivedFile, TransferError> {
        if !self.is_streaming() {
            return Err(TransferError::Unexpected("complete without an announced file"));
        }

        let received = self.buffer.len() as u64;
        if received != self.expected {
            warn!(
                "{} completed with {} bytes, {} announced",
                self.file_name, received, self.expected
            );
            self.discard(EngineState::Failed);
            return Err(TransferError::SizeMismatch {
                expected: self.expected,
                received,
            });
        }

        let mut tracker = self
            .tracker
            .take()
            .unwrap_or_else(|| ProgressTracker::new(self.expected, now));
        let progress = tracker.finish(now);
        self.state = EngineState::Completed;
        info!(
            "Received file: {} ({})",
            self.file_name,
            format_size(received)
        );

        Ok(ReceivedFile {
            name: self.file_name.clone(),
            data: self.buffer.split().freeze(),
            average_speed: progress.average_speed,
            progress,
        })
    }

    /// Drop the partial file; returns the discarded byte count if one was streaming
    pub fn abort(&mut self, cancelled: bool) -> Option<u64> {
        if !self.is_streaming() {
            return None;
        }
        let discarded = self.buffer.len() as u64;
        let state = if cancelled {
            EngineState::Cancelled
        } else {
            EngineState::Failed
        };
        self.discard(state);
        Some(discarded)
    }

    fn discard(&mut self, state: EngineState) {
        self.buffer = BytesMut::new();
        self.tracker = None;
        self.last_report = None;
        self.state = state;
    }
}
