use std::time::Duration;

/// Chunk size for binary frames (1MB)
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk a relay WebSocket message may carry (16MB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Minimum time between two progress events of one file
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum accepted file size (100GB)
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024 * 1024;

/// Maximum accepted file name length in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Capacity of the session command, outbound and link channels
pub const CHANNEL_CAPACITY: usize = 32;
