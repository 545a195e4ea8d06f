use std::path::PathBuf;
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod link;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod session;
pub mod sink;
pub mod transfer;

pub use config::ClientConfig;
pub use error::{DecodeError, SessionError, TransferError, TransportError};
pub use link::{Link, LinkEvent};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use protocol::{Frame, Role, WireMessage};
pub use queue::{FileTask, OverallProgress, QueueState, QueueSummary, TaskStatus};
pub use relay::RelayClient;
pub use session::{ConnectionState, Session, SessionHandle, SessionManager};
pub use sink::{DirectorySink, FileSink, MemorySink};
pub use transfer::{FileSource, TransferSettings};

//Report from the session to the host
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection state, presence or last error changed
    StateChanged(Session),
    PeerJoined(Role),
    PeerLeft(Role),
    /// Outgoing queue accepted, tasks in send order
    QueueStarted { tasks: Vec<FileTask> },
    FileStarted { task: FileTask, is_sending: bool },
    TransferProgress {
        task_id: Uuid,
        file_name: String,
        is_sending: bool,
        progress: ProgressSnapshot,
        overall: OverallProgress,
    },
    FileCompleted {
        task: FileTask,
        is_sending: bool,
        /// Bytes per second over the whole file
        average_speed: f64,
        /// Where the sink stored the file, if on disk
        saved_path: Option<PathBuf>,
    },
    FileFailed {
        task: FileTask,
        is_sending: bool,
        error: String,
    },
    FileCancelled { task: FileTask, is_sending: bool },
    QueueFinished(QueueSummary),
    /// Statistics the relay computed for the running file
    PeerProgress {
        transferred: u64,
        total_size: u64,
        percentage: f64,
        speed: f64,
    },
    /// `error` message from the relay
    RemoteError(String),
}
