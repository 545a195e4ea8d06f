//! Multi-file queue: runs one send engine per file, back to back
//!
//! The queue continues past a failed file and stops at the first
//! cancellation. The same bookkeeping type tracks announced files on the
//! receiving side.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::SessionEvent;
use crate::link::OutboundLink;
use crate::progress::format_size;
use crate::transfer::{FileSource, SendEngine, TransferOutcome, TransferSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileTask {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_hint: Option<String>,
    pub status: TaskStatus,
    pub bytes_moved: u64,
    pub error: Option<String>,
}

impl FileTask {
    pub fn new(name: impl Into<String>, size: u64, mime_hint: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            size,
            mime_hint,
            status: TaskStatus::Pending,
            bytes_moved: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Aggregate progress across the whole queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallProgress {
    pub completed_files: usize,
    pub total_files: usize,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    /// Bytes moved so far for the file in flight
    pub active_bytes: u64,
    pub percentage: f64,
}

impl OverallProgress {
    /// Same totals with a new byte count for the active file
    pub fn with_active_bytes(&self, active_bytes: u64) -> Self {
        let mut next = self.clone();
        next.active_bytes = active_bytes;
        next.percentage = overall_percentage(
            next.completed_bytes + active_bytes,
            next.total_bytes,
            next.completed_files == next.total_files,
        );
        next
    }
}

fn overall_percentage(moved: u64, total: u64, all_done: bool) -> f64 {
    if total == 0 {
        return if all_done { 100.0 } else { 0.0 };
    }
    (100.0 * moved as f64 / total as f64).clamp(0.0, 100.0)
}

/// Final report of a queue run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub state: QueueState,
    pub tasks: Vec<FileTask>,
    pub completed_files: usize,
    pub failed_files: usize,
    pub completed_bytes: u64,
    pub total_bytes: u64,
}

/// Ordered tasks plus aggregate counters
///
/// Status changes only move forward: a terminal task is never touched again.
#[derive(Debug, Clone)]
pub struct TransferQueue {
    tasks: Vec<FileTask>,
    current_index: Option<usize>,
    state: QueueState,
    completed_files: usize,
    completed_bytes: u64,
    total_bytes: u64,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueue {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            current_index: None,
            state: QueueState::Idle,
            completed_files: 0,
            completed_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Append a task; returns its index
    pub fn push(&mut self, task: FileTask) -> usize {
        self.total_bytes += task.size;
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    pub fn tasks(&self) -> &[FileTask] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&FileTask> {
        self.tasks.get(index)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current(&self) -> Option<&FileTask> {
        self.current_index.and_then(|i| self.tasks.get(i))
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn completed_files(&self) -> usize {
        self.completed_files
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Mark task `index` active and make it current
    pub fn begin(&mut self, index: usize) -> Option<&FileTask> {
        let task = self.tasks.get_mut(index)?;
        if task.status != TaskStatus::Pending {
            return None;
        }
        task.status = TaskStatus::Active;
        self.current_index = Some(index);
        self.state = QueueState::Running;
        Some(task)
    }

    pub fn record_progress(&mut self, bytes_moved: u64) {
        if let Some(task) = self.active_mut() {
            task.bytes_moved = bytes_moved.min(task.size).max(task.bytes_moved);
        }
    }

    /// Finish the current task successfully
    pub fn complete(&mut self) -> Option<FileTask> {
        let task = self.active_mut()?;
        task.status = TaskStatus::Completed;
        task.bytes_moved = task.size;
        let task = task.clone();
        self.completed_files += 1;
        self.completed_bytes += task.size;
        Some(task)
    }

    /// Mark the current task failed; the queue itself carries on
    pub fn fail(&mut self, error: impl Into<String>) -> Option<FileTask> {
        let task = self.active_mut()?;
        task.status = TaskStatus::Error;
        task.error = Some(error.into());
        Some(task.clone())
    }

    /// Mark the current task cancelled and stop the queue
    pub fn cancel(&mut self) -> Option<FileTask> {
        self.state = QueueState::Cancelled;
        let task = self.active_mut()?;
        task.status = TaskStatus::Cancelled;
        Some(task.clone())
    }

    /// Close the run; a queue that was not cancelled counts as completed
    pub fn finish(&mut self) -> QueueSummary {
        if self.state != QueueState::Cancelled {
            self.state = QueueState::Completed;
        }
        self.summary()
    }

    pub fn overall(&self) -> OverallProgress {
        let active_bytes = self
            .current()
            .filter(|t| t.status == TaskStatus::Active)
            .map(|t| t.bytes_moved)
            .unwrap_or(0);
        OverallProgress {
            completed_files: self.completed_files,
            total_files: self.tasks.len(),
            completed_bytes: self.completed_bytes,
            total_bytes: self.total_bytes,
            active_bytes,
            percentage: overall_percentage(
                self.completed_bytes + active_bytes,
                self.total_bytes,
                self.completed_files == self.tasks.len(),
            ),
        }
    }

    pub fn summary(&self) -> QueueSummary {
        QueueSummary {
            state: self.state,
            tasks: self.tasks.clone(),
            completed_files: self.completed_files,
            failed_files: self
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Error)
                .count(),
            completed_bytes: self.completed_bytes,
            total_bytes: self.total_bytes,
        }
    }

    fn active_mut(&mut self) -> Option<&mut FileTask> {
        let index = self.current_index?;
        self.tasks
            .get_mut(index)
            .filter(|t| t.status == TaskStatus::Active)
    }
}

/// Send every source in order over `link`
///
/// Emits queue and per-file events; the session announces the end of the
/// queue once this returns.
pub async fn run_queue(
    sources: Vec<FileSource>,
    link: OutboundLink,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    settings: TransferSettings,
) -> QueueSummary {
    let mut queue = TransferQueue::new();
    for source in &sources {
        queue.push(FileTask::new(
            source.name.clone(),
            source.size,
            source.mime_hint.clone(),
        ));
    }
    info!(
        "Starting queue: {} files, {}",
        sources.len(),
        format_size(queue.total_bytes())
    );
    let _ = events
        .send(SessionEvent::QueueStarted {
            tasks: queue.tasks().to_vec(),
        })
        .await;

    let mut engine = SendEngine::new(&link, &cancel, &events, settings);
    for (index, source) in sources.into_iter().enumerate() {
        if cancel.is_cancelled() {
            queue.cancel();
            break;
        }

        let Some(task) = queue.begin(index).cloned() else {
            continue;
        };
        let _ = events
            .send(SessionEvent::FileStarted {
                task: task.clone(),
                is_sending: true,
            })
            .await;

        let overall = queue.overall();
        let outcome = engine.run(&task, source, &overall).await;
        queue.record_progress(outcome.bytes());

        match outcome {
            TransferOutcome::Completed { average_speed, .. } => {
                if let Some(task) = queue.complete() {
                    let _ = events
                        .send(SessionEvent::FileCompleted {
                            task,
                            is_sending: true,
                            average_speed,
                            saved_path: None,
                        })
                        .await;
                }
            }
            TransferOutcome::Failed { error, .. } => {
                warn!("File {} failed, continuing with the queue", task.name);
                if let Some(task) = queue.fail(error.to_string()) {
                    let _ = events
                        .send(SessionEvent::FileFailed {
                            task,
                            is_sending: true,
                            error: error.to_string(),
                        })
                        .await;
                }
            }
            TransferOutcome::Cancelled { .. } => {
                if let Some(task) = queue.cancel() {
                    let _ = events
                        .send(SessionEvent::FileCancelled {
                            task,
                            is_sending: true,
                        })
                        .await;
                }
                break;
            }
        }
    }

    let summary = queue.finish();
    info!(
        "Queue finished ({:?}): {}/{} files, {} failed",
        summary.state,
        summary.completed_files,
        summary.tasks.len(),
        summary.failed_files
    );
    summary
}
