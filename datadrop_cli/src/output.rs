use datadrop_core::progress::{format_duration, format_size, format_speed};
use datadrop_core::{ConnectionState, QueueState, Role, SessionEvent, TaskStatus};
use std::io::Write;
use tracing::debug;

/// Turns session events into terminal output
pub struct EventPrinter {
    role: Role,
    /// A progress line is on screen without a trailing newline
    progress_open: bool,
    completed: usize,
    failed: usize,
    session_error: Option<String>,
}

impl EventPrinter {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            progress_open: false,
            completed: 0,
            failed: 0,
            session_error: None,
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Reason the session failed, once it has
    pub fn session_error(&self) -> Option<&str> {
        self.session_error.as_deref()
    }

    pub fn print(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged(session) => match session.connection_state {
                ConnectionState::Connected if session.peer_present => {
                    self.line(format!("Connected to room {}, peer ready", session.room_id));
                }
                ConnectionState::Error => {
                    let reason = session
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "connection lost".to_string());
                    self.line(format!("Session error: {}", reason));
                    self.session_error = Some(reason);
                }
                _ => {}
            },
            SessionEvent::PeerJoined(role) => self.line(format!("{} joined", role_label(*role))),
            SessionEvent::PeerLeft(role) => self.line(format!("{} left", role_label(*role))),
            SessionEvent::QueueStarted { tasks } => {
                let total: u64 = tasks.iter().map(|t| t.size).sum();
                self.line(format!(
                    "Sending {} file(s), {}",
                    tasks.len(),
                    format_size(total)
                ));
            }
            SessionEvent::FileStarted { task, is_sending } => {
                let verb = if *is_sending { "Sending" } else { "Receiving" };
                self.line(format!("{} {} ({})", verb, task.name, format_size(task.size)));
            }
            SessionEvent::TransferProgress {
                file_name,
                progress,
                overall,
                is_sending,
                ..
            } => {
                let files = if *is_sending {
                    format!(
                        "  [{}/{} files, {:.1}% overall]",
                        overall.completed_files, overall.total_files, overall.percentage
                    )
                } else {
                    String::new()
                };
                eprint!(
                    "\r  {} {:>5.1}%  {} / {}  {}  ETA {}{}   ",
                    file_name,
                    progress.percentage,
                    format_size(progress.transferred),
                    format_size(progress.total),
                    format_speed(progress.speed),
                    format_duration(progress.eta),
                    files,
                );
                let _ = std::io::stderr().flush();
                self.progress_open = true;
            }
            SessionEvent::FileCompleted {
                task,
                average_speed,
                saved_path,
                ..
            } => {
                self.completed += 1;
                let target = saved_path
                    .as_ref()
                    .map(|p| format!(" -> {}", p.display()))
                    .unwrap_or_default();
                self.line(format!(
                    "Done {} ({}, avg {}){}",
                    task.name,
                    format_size(task.size),
                    format_speed(*average_speed),
                    target
                ));
            }
            SessionEvent::FileFailed { task, error, .. } => {
                self.failed += 1;
                self.line(format!("Failed {}: {}", task.name, error));
            }
            SessionEvent::FileCancelled { task, .. } => {
                self.line(format!("Cancelled {}", task.name));
            }
            SessionEvent::QueueFinished(summary) => {
                let state = match summary.state {
                    QueueState::Cancelled => "cancelled",
                    _ => "finished",
                };
                let skipped = summary
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .count();
                self.line(format!(
                    "Queue {}: {} sent, {} failed, {} skipped ({} of {})",
                    state,
                    summary.completed_files,
                    summary.failed_files,
                    skipped,
                    format_size(summary.completed_bytes),
                    format_size(summary.total_bytes)
                ));
            }
            SessionEvent::PeerProgress { percentage, .. } => {
                debug!("{} reports {:.1}%", role_label(self.role.peer()), percentage);
            }
            SessionEvent::RemoteError(message) => self.line(format!("Relay error: {}", message)),
        }
    }

    /// Terminate a pending progress line
    pub fn finish(&mut self) {
        if self.progress_open {
            eprintln!();
            self.progress_open = false;
        }
    }

    fn line(&mut self, text: String) {
        self.finish();
        println!("{}", text);
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Sender => "Sender",
        Role::Receiver => "Receiver",
    }
}
