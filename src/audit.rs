//! Append-only audit trail of bridge events, one JSON object per line.
//!
//! The audit log is diagnostic, not durable state: rotation may drop a line
//! appended between its snapshot and its rename, and readers skip lines they
//! cannot parse.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Layout;
use crate::fs_util::{append_json_line, read_lines, rewrite_lines, sanitize_name};
use crate::{tlog_debug, tlog_warn, Result};

/// Default rotation threshold (5 MiB).
pub const DEFAULT_MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    BridgeStart,
    BridgeShutdown,
    TaskClaimed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskPermanentlyFailed,
    WorkerQuarantined,
    WorkerIdle,
    InboxRotated,
    OutboxRotated,
    CliTimeout,
    CliError,
    ShutdownReceived,
    DrainReceived,
    WorkerRestarted,
    WorkerAbandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub team_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, team_name: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            team_name: team_name.to_string(),
            worker_name: None,
            task_id: None,
            details: None,
        }
    }

    pub fn worker(mut self, worker: &str) -> Self {
        self.worker_name = Some(worker.to_string());
        self
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Read filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub worker_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type.map_or(true, |t| event.event_type == t)
            && self
                .worker_name
                .as_deref()
                .map_or(true, |w| event.worker_name.as_deref() == Some(w))
            && self.since.map_or(true, |since| event.timestamp >= since)
    }
}

/// The audit log of one team.
#[derive(Debug, Clone)]
pub struct AuditLog {
    team: String,
    path: PathBuf,
}

impl AuditLog {
    pub fn new(layout: &Layout, team: &str) -> Result<Self> {
        sanitize_name("team name", team)?;
        Ok(Self {
            team: team.to_string(),
            path: layout.audit_log_path(team)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    pub fn log(&self, event: &AuditEvent) -> Result<()> {
        append_json_line(&self.path, event)
    }

    /// Append, logging instead of failing. For callers whose own work must
    /// not depend on the audit trail.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(&event) {
            tlog_warn!("Failed to write audit event {:?}: {}", event.event_type, e);
        }
    }

    /// Events matching `filter`, oldest first. Never fails: an unreadable
    /// log reads as empty and malformed lines are skipped.
    pub fn read(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let lines = match read_lines(&self.path) {
            Ok(lines) => lines,
            Err(e) => {
                tlog_warn!("Failed to read audit log {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        lines
            .iter()
            .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
            .filter(|event| filter.matches(event))
            .collect()
    }

    /// Rotate once the file exceeds `max_bytes`, keeping the newer half of
    /// the lines. Halving repeats until the result fits or one line remains.
    /// Returns whether the file was rewritten; a log that is already down
    /// to one line is left alone.
    pub fn rotate(&self, max_bytes: u64) -> Result<bool> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(false),
        };
        if size <= max_bytes {
            return Ok(false);
        }

        let lines = read_lines(&self.path)?;
        let mut keep_from = lines.len() / 2;
        if keep_from == 0 {
            // A single oversized line: nothing can be dropped.
            return Ok(false);
        }
        while keep_from + 1 < lines.len() && suffix_bytes(&lines[keep_from..]) > max_bytes {
            keep_from += (lines.len() - keep_from) / 2;
        }
        rewrite_lines(&self.path, &lines[keep_from..])?;
        tlog_debug!(
            "Rotated audit log {}: kept {} of {} lines",
            self.path.display(),
            lines.len() - keep_from,
            lines.len()
        );
        Ok(true)
    }
}

fn suffix_bytes(lines: &[String]) -> u64 {
    lines.iter().map(|l| l.len() as u64 + 1).sum()
}
