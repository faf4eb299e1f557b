//! Per-worker inbox/outbox streams and lifecycle signal files.
//!
//! ```text
//! <state>/<team>/inbox/<worker>.jsonl            monitor/peers -> worker
//! <state>/<team>/inbox/<worker>.cursor.json      worker's read position
//! <state>/<team>/outbox/<worker>.jsonl           worker -> monitor
//! <state>/<team>/outbox/<worker>.cursor.json     monitor's read position
//! <state>/<team>/signals/<worker>.shutdown.json
//! <state>/<team>/signals/<worker>.drain.json
//! ```
//!
//! Cursors hold a byte offset and only ever advance past complete lines, so
//! a reader never consumes a half-written message. A cursor beyond the end
//! of its file (left behind by a crash between truncation and cursor reset)
//! is clamped to the file length.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Layout;
use crate::fs_util::{
    append_json_line, atomic_write, atomic_write_json, read_json, read_lines, remove_if_exists,
    rewrite_lines, sanitize_name,
};
use crate::{tlog_debug, Result};

/// Default number of lines a mailbox keeps after rotation.
pub const DEFAULT_MAX_MAILBOX_LINES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxMessageType {
    Message,
    /// Extra context to include in the next task prompt.
    Context,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    #[serde(rename = "type")]
    pub message_type: InboxMessageType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl InboxMessage {
    pub fn new(message_type: InboxMessageType, content: impl Into<String>) -> Self {
        Self {
            message_type,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxMessageType {
    Ready,
    TaskComplete,
    TaskFailed,
    Idle,
    AllTasksComplete,
    ShutdownAck,
    DrainAck,
    Error,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    #[serde(rename = "type")]
    pub message_type: OutboxMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new(message_type: OutboxMessageType) -> Self {
        Self {
            message_type,
            task_id: None,
            summary: None,
            message: None,
            error: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Content of a shutdown or drain marker file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub request_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Shutdown,
    Drain,
}

impl SignalKind {
    fn suffix(&self) -> &'static str {
        match self {
            SignalKind::Shutdown => "shutdown",
            SignalKind::Drain => "drain",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct Cursor {
    bytes_read: u64,
}

/// Which stream a cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Inbox,
    Outbox,
}

impl Stream {
    fn dir_name(&self) -> &'static str {
        match self {
            Stream::Inbox => "inbox",
            Stream::Outbox => "outbox",
        }
    }
}

/// Mailboxes and signals of one team.
#[derive(Debug, Clone)]
pub struct Mailbox {
    team: String,
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(layout: &Layout, team: &str) -> Result<Self> {
        Ok(Self {
            team: team.to_string(),
            dir: layout.team_state_dir(team)?,
        })
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    fn stream_path(&self, stream: Stream, worker: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join(stream.dir_name())
            .join(format!("{}.jsonl", sanitize_name("worker name", worker)?)))
    }

    fn cursor_path(&self, stream: Stream, worker: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join(stream.dir_name())
            .join(format!("{}.cursor.json", sanitize_name("worker name", worker)?)))
    }

    fn signal_path(&self, kind: SignalKind, worker: &str) -> Result<PathBuf> {
        Ok(self.dir.join("signals").join(format!(
            "{}.{}.json",
            sanitize_name("worker name", worker)?,
            kind.suffix()
        )))
    }

    // ----- outbox (written by the worker) -----

    pub fn append_outbox(&self, worker: &str, message: &OutboxMessage) -> Result<()> {
        append_json_line(&self.stream_path(Stream::Outbox, worker)?, message)
    }

    /// Monitor side: messages appended since the last call, advancing the
    /// monitor's cursor.
    pub fn read_new_outbox_messages(&self, worker: &str) -> Result<Vec<OutboxMessage>> {
        self.read_new(Stream::Outbox, worker, true)
    }

    /// Like [`Self::read_new_outbox_messages`] without moving the cursor.
    pub fn peek_new_outbox_messages(&self, worker: &str) -> Result<Vec<OutboxMessage>> {
        self.read_new(Stream::Outbox, worker, false)
    }

    pub fn read_all_outbox_messages(&self, worker: &str) -> Result<Vec<OutboxMessage>> {
        read_messages(&self.stream_path(Stream::Outbox, worker)?)
    }

    pub fn reset_outbox_cursor(&self, worker: &str) -> Result<()> {
        atomic_write_json(&self.cursor_path(Stream::Outbox, worker)?, &Cursor::default())
    }

    /// New outbox messages of every worker that has an outbox.
    pub fn read_all_team_outbox_messages(&self) -> Result<Vec<(String, Vec<OutboxMessage>)>> {
        let mut out = Vec::new();
        for worker in self.stream_workers(Stream::Outbox) {
            let messages = self.read_new_outbox_messages(&worker)?;
            if !messages.is_empty() {
                out.push((worker, messages));
            }
        }
        Ok(out)
    }

    pub fn rotate_outbox_if_needed(&self, worker: &str, max_lines: usize) -> Result<bool> {
        self.rotate(Stream::Outbox, worker, max_lines)
    }

    // ----- inbox (written by others, consumed by the worker) -----

    pub fn append_inbox(&self, worker: &str, message: &InboxMessage) -> Result<()> {
        append_json_line(&self.stream_path(Stream::Inbox, worker)?, message)
    }

    /// Messages appended since the last call; advances the worker's cursor.
    pub fn read_new_inbox_messages(&self, worker: &str) -> Result<Vec<InboxMessage>> {
        self.read_new(Stream::Inbox, worker, true)
    }

    /// Every message in the inbox, ignoring the cursor.
    pub fn read_all_inbox_messages(&self, worker: &str) -> Result<Vec<InboxMessage>> {
        read_messages(&self.stream_path(Stream::Inbox, worker)?)
    }

    /// Empty the inbox and reset its cursor.
    pub fn clear_inbox(&self, worker: &str) -> Result<()> {
        let path = self.stream_path(Stream::Inbox, worker)?;
        if path.exists() {
            atomic_write(&path, b"")?;
        }
        atomic_write_json(&self.cursor_path(Stream::Inbox, worker)?, &Cursor::default())
    }

    pub fn rotate_inbox_if_needed(&self, worker: &str, max_lines: usize) -> Result<bool> {
        self.rotate(Stream::Inbox, worker, max_lines)
    }

    // ----- signals -----

    pub fn write_signal(&self, kind: SignalKind, worker: &str, signal: &Signal) -> Result<()> {
        atomic_write_json(&self.signal_path(kind, worker)?, signal)
    }

    pub fn check_signal(&self, kind: SignalKind, worker: &str) -> Result<Option<Signal>> {
        Ok(read_json(&self.signal_path(kind, worker)?))
    }

    pub fn delete_signal(&self, kind: SignalKind, worker: &str) -> Result<bool> {
        remove_if_exists(&self.signal_path(kind, worker)?)
    }

    pub fn write_shutdown_signal(&self, worker: &str, reason: &str) -> Result<Signal> {
        let signal = Signal::new(reason);
        self.write_signal(SignalKind::Shutdown, worker, &signal)?;
        Ok(signal)
    }

    pub fn check_shutdown_signal(&self, worker: &str) -> Result<Option<Signal>> {
        self.check_signal(SignalKind::Shutdown, worker)
    }

    pub fn write_drain_signal(&self, worker: &str, reason: &str) -> Result<Signal> {
        let signal = Signal::new(reason);
        self.write_signal(SignalKind::Drain, worker, &signal)?;
        Ok(signal)
    }

    pub fn check_drain_signal(&self, worker: &str) -> Result<Option<Signal>> {
        self.check_signal(SignalKind::Drain, worker)
    }

    /// Remove every mailbox, cursor and signal file of a worker.
    pub fn cleanup_worker_files(&self, worker: &str) -> Result<()> {
        for stream in [Stream::Inbox, Stream::Outbox] {
            remove_if_exists(&self.stream_path(stream, worker)?)?;
            remove_if_exists(&self.cursor_path(stream, worker)?)?;
        }
        for kind in [SignalKind::Shutdown, SignalKind::Drain] {
            remove_if_exists(&self.signal_path(kind, worker)?)?;
        }
        tlog_debug!("Cleaned up mailbox files for {}/{}", self.team, worker);
        Ok(())
    }

    // ----- internals -----

    fn read_cursor(&self, stream: Stream, worker: &str) -> Result<Cursor> {
        Ok(read_json(&self.cursor_path(stream, worker)?).unwrap_or_default())
    }

    fn read_new<T: DeserializeOwned>(
        &self,
        stream: Stream,
        worker: &str,
        advance: bool,
    ) -> Result<Vec<T>> {
        let path = self.stream_path(stream, worker)?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let len = content.len() as u64;
        let cursor = self.read_cursor(stream, worker)?;
        let start = cursor.bytes_read.min(len) as usize;
        if cursor.bytes_read > len {
            tlog_debug!(
                "Clamping stale {} cursor for {}/{} from {} to {}",
                stream.dir_name(),
                self.team,
                worker,
                cursor.bytes_read,
                len
            );
        }

        let unread = &content[start..];
        // Only complete lines are consumed.
        let consumed = unread
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let messages = parse_lines(&unread[..consumed]);

        let next = Cursor {
            bytes_read: (start + consumed) as u64,
        };
        if advance && next != cursor {
            atomic_write_json(&self.cursor_path(stream, worker)?, &next)?;
        }
        Ok(messages)
    }

    /// Keep only the newest `max_lines` lines. Unread messages stay unread:
    /// the cursor is shifted by the number of bytes dropped from the front.
    fn rotate(&self, stream: Stream, worker: &str, max_lines: usize) -> Result<bool> {
        let path = self.stream_path(stream, worker)?;
        let lines = read_lines(&path)?;
        if lines.len() <= max_lines {
            return Ok(false);
        }

        let old_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let kept = &lines[lines.len() - max_lines..];
        rewrite_lines(&path, kept)?;
        let new_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let cursor_path = self.cursor_path(stream, worker)?;
        if let Some(cursor) = read_json::<Cursor>(&cursor_path) {
            let dropped = old_len.saturating_sub(new_len);
            let shifted = Cursor {
                bytes_read: cursor.bytes_read.saturating_sub(dropped).min(new_len),
            };
            atomic_write_json(&cursor_path, &shifted)?;
        }

        tlog_debug!(
            "Rotated {} for {}/{}: {} -> {} lines",
            stream.dir_name(),
            self.team,
            worker,
            lines.len(),
            kept.len()
        );
        Ok(true)
    }

    fn stream_workers(&self, stream: Stream) -> Vec<String> {
        let entries = match fs::read_dir(self.dir.join(stream.dir_name())) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut workers: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| name.strip_suffix(".jsonl").map(String::from))
            .filter(|w| sanitize_name("worker name", w).is_ok())
            .collect();
        workers.sort();
        workers
    }
}

fn parse_lines<T: DeserializeOwned>(bytes: &[u8]) -> Vec<T> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

fn read_messages<T: DeserializeOwned>(path: &std::path::Path) -> Result<Vec<T>> {
    Ok(read_lines(path)?
        .iter()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
