//! Throughput, ETA and percentage computation for a single file
//!
//! The tracker is pure: callers pass in the sample time so the numbers can be
//! reproduced in tests.

use std::time::{Duration, Instant};

/// Lower bound for a measuring interval, in seconds
const MIN_INTERVAL_SECS: f64 = 1e-3;

/// A byte count observed at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub at: Instant,
    pub bytes: u64,
}

/// Reportable progress of one file
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub transferred: u64,
    pub total: u64,
    /// Bytes per second since the previous sample
    pub speed: f64,
    /// Bytes per second since the start
    pub average_speed: f64,
    /// `None` while the average speed is still zero
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub percentage: f64,
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    start: ProgressSample,
    last: ProgressSample,
    total: u64,
    percentage: f64,
}

impl ProgressTracker {
    pub fn new(total: u64, now: Instant) -> Self {
        let start = ProgressSample { at: now, bytes: 0 };
        Self {
            start,
            last: start,
            total,
            percentage: 0.0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn last_sample(&self) -> ProgressSample {
        self.last
    }

    /// Record `bytes_moved` at `now` and compute a snapshot
    ///
    /// The retained sample moves to `now`, so the next call measures a fresh
    /// interval.
    pub fn sample(&mut self, now: Instant, bytes_moved: u64) -> ProgressSnapshot {
        let interval = secs_between(self.last.at, now);
        let speed = if interval <= 0.0 {
            0.0
        } else {
            bytes_moved.saturating_sub(self.last.bytes) as f64 / interval.max(MIN_INTERVAL_SECS)
        };

        let elapsed = secs_between(self.start.at, now);
        let average_speed = if elapsed <= 0.0 {
            0.0
        } else {
            bytes_moved as f64 / elapsed.max(MIN_INTERVAL_SECS)
        };

        let eta = if average_speed > 0.0 {
            let remaining = self.total.saturating_sub(bytes_moved) as f64;
            Duration::try_from_secs_f64(remaining / average_speed).ok()
        } else {
            None
        };

        let percentage = if self.total > 0 {
            (100.0 * bytes_moved as f64 / self.total as f64).clamp(0.0, 100.0)
        } else {
            0.0
        };
        // bytes only grow within one file, keep the reported value monotonic
        self.percentage = self.percentage.max(percentage);
        self.last = ProgressSample {
            at: now,
            bytes: bytes_moved,
        };

        ProgressSnapshot {
            transferred: bytes_moved,
            total: self.total,
            speed,
            average_speed,
            eta,
            elapsed: now.saturating_duration_since(self.start.at),
            percentage: self.percentage,
        }
    }

    /// Terminal snapshot once every byte has moved; always 100%
    pub fn finish(&mut self, now: Instant) -> ProgressSnapshot {
        let mut snapshot = self.sample(now, self.total);
        self.percentage = 100.0;
        snapshot.percentage = 100.0;
        snapshot.eta = Some(Duration::ZERO);
        snapshot
    }
}

fn secs_between(earlier: Instant, later: Instant) -> f64 {
    later
        .checked_duration_since(earlier)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Format bytes using binary units ("2.38 MB")
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_second: f64) -> String {
    let bps = if bytes_per_second.is_finite() && bytes_per_second > 0.0 {
        bytes_per_second as u64
    } else {
        0
    };
    format!("{}/s", format_size(bps))
}

/// Format a duration as "42s", "3m 7s" or "1h 15m"
pub fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "calculating...".to_string();
    };

    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
