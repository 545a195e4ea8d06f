use anyhow::{Context, Result};
use bytes::Bytes;
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EngineState, TransferOutcome, TransferSettings};
use crate::SessionEvent;
use crate::error::TransferError;
use crate::link::OutboundLink;
use crate::progress::{ProgressSnapshot, ProgressTracker, format_size};
use crate::protocol::{Frame, WireMessage, encode};
use crate::queue::{FileTask, OverallProgress};

/// A file waiting to be sent: its announced metadata plus a reader for the bytes
pub struct FileSource {
    pub name: String,
    pub size: u64,
    pub mime_hint: Option<String>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileSource {
    /// Open a file on disk, taking name and size from the filesystem
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("Failed to read metadata of {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let mime_hint = mime_guess::from_path(path).first().map(|m| m.to_string());

        Ok(Self {
            name,
            size: metadata.len(),
            mime_hint,
            reader: Box::new(file),
        })
    }

    pub fn from_reader(
        name: impl Into<String>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let name = name.into();
        let mime_hint = mime_guess::from_path(&name).first().map(|m| m.to_string());
        Self {
            name,
            size,
            mime_hint,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let size = data.len() as u64;
        Self::from_reader(name, size, Cursor::new(data))
    }

    pub fn with_mime_hint(mut self, mime_hint: impl Into<String>) -> Self {
        self.mime_hint = Some(mime_hint.into());
        self
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime_hint", &self.mime_hint)
            .finish_non_exhaustive()
    }
}

enum StreamEnd {
    Done { average_speed: f64 },
    Cancelled,
}

/// Streams one file as `file_info`, binary chunks and `complete`
///
/// Every frame goes through the session, which may refuse it (peer gone,
/// channel closed). Cancellation is checked before each read and each write.
pub struct SendEngine<'a> {
    link: &'a OutboundLink,
    cancel: &'a CancellationToken,
    events: &'a mpsc::Sender<SessionEvent>,
    settings: TransferSettings,
    state: EngineState,
}

impl<'a> SendEngine<'a> {
    pub fn new(
        link: &'a OutboundLink,
        cancel: &'a CancellationToken,
        events: &'a mpsc::Sender<SessionEvent>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            link,
            cancel,
            events,
            settings,
            state: EngineState::Idle,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub async fn run(
        &mut self,
        task: &FileTask,
        mut source: FileSource,
        overall: &OverallProgress,
    ) -> TransferOutcome {
        let mut sent = 0u64;
        let outcome = match self.stream(task, &mut source, overall, &mut sent).await {
            Ok(StreamEnd::Done { average_speed }) => TransferOutcome::Completed {
                bytes: sent,
                average_speed,
            },
            Ok(StreamEnd::Cancelled) => {
                info!("Sending {} cancelled after {} bytes", task.name, sent);
                TransferOutcome::Cancelled { bytes: sent }
            }
            // a write refused because of the cancel is not a failure
            Err(error) if self.cancel.is_cancelled() => {
                debug!("Sending {} stopped by cancel: {}", task.name, error);
                TransferOutcome::Cancelled { bytes: sent }
            }
            Err(error) => {
                warn!("Sending {} failed after {} bytes: {}", task.name, sent, error);
                TransferOutcome::Failed { bytes: sent, error }
            }
        };
        self.state = outcome.state();
        outcome
    }

    async fn stream(
        &mut self,
        task: &FileTask,
        source: &mut FileSource,
        overall: &OverallProgress,
        sent: &mut u64,
    ) -> Result<StreamEnd, TransferError> {
        let size = source.size;
        if self.cancel.is_cancelled() {
            return Ok(StreamEnd::Cancelled);
        }

        info!("Sending file: {} ({})", source.name, format_size(size));
        self.send_control(&WireMessage::FileInfo {
            name: source.name.clone(),
            size,
        })
        .await?;
        self.state = EngineState::Announced;

        let start = Instant::now();
        let mut tracker = ProgressTracker::new(size, start);
        let mut last_report: Option<Instant> = None;
        let chunk_size = self.settings.chunk_size.max(1) as u64;
        self.state = EngineState::Streaming;

        while *sent < size {
            if self.cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            let len = chunk_size.min(size - *sent) as usize;
            let mut buffer = vec![0u8; len];
            source.reader.read_exact(&mut buffer).await?;

            if self.cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            self.link.send(Frame::Binary(Bytes::from(buffer))).await?;
            *sent += len as u64;

            // the last chunk is reported by the final snapshot below
            let now = Instant::now();
            let due = last_report
                .map(|at| now.duration_since(at) >= self.settings.progress_interval)
                .unwrap_or(true);
            if *sent < size && due {
                let snapshot = tracker.sample(now, *sent);
                last_report = Some(now);
                self.report(task, snapshot, overall.with_active_bytes(*sent))
                    .await;
            }

            tokio::task::yield_now().await;
        }

        let snapshot = tracker.finish(Instant::now());
        let average_speed = snapshot.average_speed;
        self.report(task, snapshot, overall.with_active_bytes(size))
            .await;

        if self.cancel.is_cancelled() {
            return Ok(StreamEnd::Cancelled);
        }
        self.send_control(&WireMessage::Complete {
            average_speed: Some(average_speed),
        })
        .await?;
        debug!("Sent complete for {}", source.name);

        Ok(StreamEnd::Done { average_speed })
    }

    async fn send_control(&self, msg: &WireMessage) -> Result<(), TransferError> {
        let frame = encode(msg)?;
        self.link.send(frame).await?;
        Ok(())
    }

    async fn report(
        &self,
        task: &FileTask,
        progress: ProgressSnapshot,
        overall: OverallProgress,
    ) {
        let _ = self
            .events
            .send(SessionEvent::TransferProgress {
                task_id: task.id,
                file_name: task.name.clone(),
                is_sending: true,
                progress,
                overall,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::link::Outbound;
    use crate::protocol::decode;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;

    /// Acknowledges every frame and records it
    fn capture(
        mut requests: mpsc::Receiver<Outbound>,
        fail_after: Option<usize>,
    ) -> tokio::task::JoinHandle<Vec<Frame>> {
        tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(Outbound { frame, ack }) = requests.recv().await {
                if fail_after.is_some_and(|n| frames.len() >= n) {
                    let _ = ack.send(Err(SessionError::PeerLeft));
                    continue;
                }
                frames.push(frame);
                let _ = ack.send(Ok(()));
            }
            frames
        })
    }

    fn task_for(source: &FileSource) -> FileTask {
        FileTask::new(source.name.clone(), source.size, source.mime_hint.clone())
    }

    fn binary_lengths(frames: &[Frame]) -> Vec<usize> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Binary(data) => Some(data.len()),
                Frame::Text(_) => None,
            })
            .collect()
    }

    fn control_types(frames: &[Frame]) -> Vec<&'static str> {
        frames
            .iter()
            .filter_map(|f| decode(f).ok())
            .map(|m| m.type_name())
            .collect()
    }

    fn drain(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<f64> {
        let mut percentages = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::TransferProgress { progress, .. } = event {
                percentages.push(progress.percentage);
            }
        }
        percentages
    }

    #[tokio::test]
    async fn test_chunking_of_multi_chunk_file() {
        let (link, requests) = OutboundLink::channel(8);
        let collector = capture(requests, None);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let data: Vec<u8> = (0..2_500_000u32).map(|i| (i % 251) as u8).collect();
        let source = FileSource::from_bytes("big.bin", data.clone());
        let task = task_for(&source);

        let mut engine = SendEngine::new(&link, &cancel, &events_tx, TransferSettings::default());
        let outcome = engine
            .run(&task, source, &OverallProgress::default())
            .await;
        assert!(matches!(
            outcome,
            TransferOutcome::Completed {
                bytes: 2_500_000,
                ..
            }
        ));
        assert_eq!(engine.state(), EngineState::Completed);

        drop(link);
        let frames = collector.await.unwrap();
        assert_eq!(binary_lengths(&frames), vec![1_048_576, 1_048_576, 402_848]);
        assert_eq!(control_types(&frames), vec!["file_info", "complete"]);

        let rebuilt: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Binary(data) => Some(data.to_vec()),
                Frame::Text(_) => None,
            })
            .flatten()
            .collect();
        assert_eq!(rebuilt, data);

        let percentages = drain(&mut events_rx);
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percentages.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_empty_file_sends_announce_and_complete() {
        let (link, requests) = OutboundLink::channel(8);
        let collector = capture(requests, None);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let source = FileSource::from_bytes("empty.txt", Bytes::new());
        let task = task_for(&source);
        let outcome = SendEngine::new(&link, &cancel, &events_tx, TransferSettings::default())
            .run(&task, source, &OverallProgress::default())
            .await;
        assert!(matches!(outcome, TransferOutcome::Completed { bytes: 0, .. }));

        drop(link);
        let frames = collector.await.unwrap();
        assert!(binary_lengths(&frames).is_empty());
        assert_eq!(control_types(&frames), vec!["file_info", "complete"]);
        assert_eq!(drain(&mut events_rx), vec![100.0]);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_sends_no_complete() {
        let (link, mut requests) = OutboundLink::channel(8);
        let (events_tx, _events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        // cancel once the second chunk has been acknowledged
        let trigger = cancel.clone();
        let collector = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(Outbound { frame, ack }) = requests.recv().await {
                frames.push(frame);
                if binary_lengths(&frames).len() == 2 {
                    trigger.cancel();
                }
                let _ = ack.send(Ok(()));
            }
            frames
        });

        let source = FileSource::from_bytes("movie.mkv", vec![7u8; 100]);
        let task = task_for(&source);
        let settings = TransferSettings {
            chunk_size: 10,
            ..TransferSettings::default()
        };
        let outcome = SendEngine::new(&link, &cancel, &events_tx, settings)
            .run(&task, source, &OverallProgress::default())
            .await;
        assert!(matches!(outcome, TransferOutcome::Cancelled { bytes: 20 }));

        drop(link);
        let frames = collector.await.unwrap();
        assert_eq!(binary_lengths(&frames).len(), 2);
        assert_eq!(control_types(&frames), vec!["file_info"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_sends_nothing() {
        let (link, requests) = OutboundLink::channel(8);
        let collector = capture(requests, None);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let source = FileSource::from_bytes("a.txt", "hello");
        let task = task_for(&source);
        let outcome = SendEngine::new(&link, &cancel, &events_tx, TransferSettings::default())
            .run(&task, source, &OverallProgress::default())
            .await;
        assert!(matches!(outcome, TransferOutcome::Cancelled { bytes: 0 }));

        drop(link);
        assert!(collector.await.unwrap().is_empty());
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::other("disk unplugged")))
        }
    }

    #[tokio::test]
    async fn test_read_failure_fails_transfer() {
        let (link, requests) = OutboundLink::channel(8);
        let collector = capture(requests, None);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let source = FileSource::from_reader("broken.bin", 64, FailingReader);
        let task = task_for(&source);
        let mut engine = SendEngine::new(&link, &cancel, &events_tx, TransferSettings::default());
        let outcome = engine.run(&task, source, &OverallProgress::default()).await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed {
                bytes: 0,
                error: TransferError::Read(_)
            }
        ));
        assert_eq!(engine.state(), EngineState::Failed);

        drop(engine);
        drop(link);
        assert_eq!(control_types(&collector.await.unwrap()), vec!["file_info"]);
    }

    #[tokio::test]
    async fn test_short_reader_fails_transfer() {
        let (link, requests) = OutboundLink::channel(8);
        let _collector = capture(requests, None);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        // announces more bytes than the reader holds
        let source = FileSource::from_reader("short.bin", 10, Cursor::new(vec![1u8; 4]));
        let task = task_for(&source);
        let outcome = SendEngine::new(&link, &cancel, &events_tx, TransferSettings::default())
            .run(&task, source, &OverallProgress::default())
            .await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed {
                error: TransferError::Read(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rejected_write_fails_transfer() {
        let (link, requests) = OutboundLink::channel(8);
        let _collector = capture(requests, Some(2));
        let (events_tx, _events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let source = FileSource::from_bytes("doc.pdf", vec![1u8; 50]);
        let task = task_for(&source);
        let settings = TransferSettings {
            chunk_size: 10,
            progress_interval: Duration::ZERO,
        };
        let outcome = SendEngine::new(&link, &cancel, &events_tx, settings)
            .run(&task, source, &OverallProgress::default())
            .await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed {
                bytes: 10,
                error: TransferError::Channel(SessionError::PeerLeft)
            }
        ));
    }

    #[tokio::test]
    async fn test_write_refused_after_cancel_counts_as_cancelled() {
        let (link, mut requests) = OutboundLink::channel(8);
        let (events_tx, _events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        // the session cancels while the last chunk is queued and refuses it
        let trigger = cancel.clone();
        let session = tokio::spawn(async move {
            let mut written = Vec::new();
            while let Some(Outbound { frame, ack }) = requests.recv().await {
                if binary_lengths(&written).len() == 2 {
                    trigger.cancel();
                    let _ = ack.send(Err(SessionError::Cancelled));
                    continue;
                }
                written.push(frame);
                let _ = ack.send(Ok(()));
            }
            written
        });

        let source = FileSource::from_bytes("slides.key", vec![3u8; 30]);
        let task = task_for(&source);
        let settings = TransferSettings {
            chunk_size: 10,
            ..TransferSettings::default()
        };
        let mut engine = SendEngine::new(&link, &cancel, &events_tx, settings);
        let outcome = engine.run(&task, source, &OverallProgress::default()).await;
        assert!(matches!(outcome, TransferOutcome::Cancelled { bytes: 20 }));
        assert_eq!(engine.state(), EngineState::Cancelled);

        drop(engine);
        drop(link);
        let written = session.await.unwrap();
        assert_eq!(control_types(&written), vec!["file_info"]);
    }

    #[tokio::test]
    async fn test_open_reads_name_size_and_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"twelve bytes").await.unwrap();

        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.name, "notes.txt");
        assert_eq!(source.size, 12);
        assert_eq!(source.mime_hint.as_deref(), Some("text/plain"));

        assert!(FileSource::open(dir.path()).await.is_err());
        assert!(FileSource::open(&dir.path().join("missing")).await.is_err());
    }
}
