//! Single-file chunked transfer over the relay channel.
//!
//! This module provides:
//! - The sending engine (file_info, binary chunks, complete)
//! - The receiving engine (reassembly with size checks)
//! - Shared limits and name sanitizing helpers

pub mod constants;
pub mod receiver;
pub mod sender;
pub mod utils;

use std::time::Duration;

use crate::error::TransferError;
use constants::{CHUNK_SIZE, PROGRESS_INTERVAL};

pub use receiver::{ChunkOutcome, ReceiveEngine, ReceivedFile};
pub use sender::{FileSource, SendEngine};

/// Lifecycle of one file inside an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Announced,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Cancelled | EngineState::Failed
        )
    }
}

/// Tunables shared by both engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: usize,
    /// Minimum spacing between two progress events of the same file
    pub progress_interval: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

/// How a single file run ended
#[derive(Debug)]
pub enum TransferOutcome {
    Completed { bytes: u64, average_speed: f64 },
    Cancelled { bytes: u64 },
    Failed { bytes: u64, error: TransferError },
}

impl TransferOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            TransferOutcome::Completed { bytes, .. }
            | TransferOutcome::Cancelled { bytes }
            | TransferOutcome::Failed { bytes, .. } => *bytes,
        }
    }

    pub fn state(&self) -> EngineState {
        match self {
            TransferOutcome::Completed { .. } => EngineState::Completed,
            TransferOutcome::Cancelled { .. } => EngineState::Cancelled,
            TransferOutcome::Failed { .. } => EngineState::Failed,
        }
    }
}
