//! Task store: task records, dependency gating and the claim protocol.
//!
//! Task files are created externally as `pending` and are only ever mutated
//! through [`TaskStore::update_task`], a read-modify-write that patches the
//! named fields and passes every other field through untouched.
//!
//! ## Claiming
//!
//! [`TaskStore::find_next_task`] does not provide mutual exclusion. It writes
//! a claim, waits a short fixed interval so racing claimants can land their
//! own writes, then re-reads the file and keeps the task only if the claim on
//! disk is still its own. Two processes can still both complete a full
//! read-modify-write cycle; the later rename wins. In the common case, where
//! the verification delay exceeds every racer's write latency, at most one
//! caller sees its own claim. This is a probabilistic property, not an atomic
//! guarantee. A starved claimant can still lose or win unexpectedly.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Layout;
use crate::fs_util::{
    atomic_write_json, read_json, sanitize_name, sanitize_task_id, TMP_MARKER,
};
use crate::{tlog_debug, tlog_warn, Error, Result};

/// Default maximum retries before a task is permanently failed.
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 5;

/// Default wait between writing a claim and verifying it.
pub const DEFAULT_CLAIM_DELAY: Duration = Duration::from_millis(50);

const FAILURE_SUFFIX: &str = ".failure.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    /// Any status string this subsystem does not manage. Never eligible.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A task record as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskFile {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
    /// Fields this subsystem does not know about, in file order.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskFile {
    /// Completed because the retry budget ran out, not because it succeeded.
    pub fn is_permanently_failed(&self) -> bool {
        self.status == TaskStatus::Completed
            && matches!(self.extra.get("permanentlyFailed"), Some(Value::Bool(true)))
    }
}

/// Outcome of reading a task file.
///
/// Callers that only care about presence use [`TaskStore::read_task`], which
/// reports `Missing` and `Malformed` alike as `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRead {
    Found(TaskFile),
    Missing,
    Malformed,
}

impl TaskRead {
    pub fn into_option(self) -> Option<TaskFile> {
        match self {
            TaskRead::Found(task) => Some(task),
            TaskRead::Missing | TaskRead::Malformed => None,
        }
    }
}

/// A partial update. Only fields that are set are written.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
    /// Arbitrary extra fields to set.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Failure metadata kept next to a task as `<id>.failure.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailureSidecar {
    pub task_id: String,
    pub last_error: String,
    pub retry_count: u32,
    pub last_failed_at: DateTime<Utc>,
}

/// Order task ids: numeric ids first in numeric order, then everything else
/// lexicographically. Total, so it is safe for `sort_by`.
pub fn compare_task_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Identity written with a claim; all three must survive verification.
#[derive(Debug, Clone)]
struct ClaimIdentity {
    worker: String,
    pid: u32,
    token: String,
}

impl ClaimIdentity {
    fn new(worker: &str) -> Self {
        Self {
            worker: worker.to_string(),
            pid: std::process::id(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn update(&self) -> TaskUpdate {
        TaskUpdate {
            claimed_by: Some(self.worker.clone()),
            claimed_at: Some(Utc::now().timestamp_millis()),
            claim_pid: Some(self.pid),
            claim_token: Some(self.token.clone()),
            ..Default::default()
        }
    }

    fn holds(&self, task: &TaskFile) -> bool {
        task.status == TaskStatus::Pending
            && task.claimed_by.as_deref() == Some(self.worker.as_str())
            && task.claim_pid == Some(self.pid)
            && task.claim_token.as_deref() == Some(self.token.as_str())
    }
}

/// Task files of one team.
#[derive(Debug, Clone)]
pub struct TaskStore {
    team: String,
    dir: PathBuf,
    claim_delay: Duration,
}

impl TaskStore {
    /// Open the task directory of `team`. The directory need not exist yet.
    ///
    /// # Errors
    /// Fails if the team name is not allow-listed or the directory would
    /// escape the task root.
    pub fn new(layout: &Layout, team: &str) -> Result<Self> {
        let dir = layout.team_tasks_dir(team)?;
        Ok(Self {
            team: team.to_string(),
            dir,
            claim_delay: DEFAULT_CLAIM_DELAY,
        })
    }

    pub fn with_claim_delay(mut self, delay: Duration) -> Self {
        self.claim_delay = delay;
        self
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.json", sanitize_task_id(id)?)))
    }

    fn failure_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join(format!("{}{}", sanitize_task_id(id)?, FAILURE_SUFFIX)))
    }

    /// Read a task, distinguishing a missing file from an unparsable one.
    pub fn read_task_entry(&self, id: &str) -> Result<TaskRead> {
        let path = self.task_path(id)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TaskRead::Missing),
            Err(e) => {
                tlog_debug!("read_task {}: {}", path.display(), e);
                return Ok(TaskRead::Malformed);
            }
        };
        match serde_json::from_str::<TaskFile>(&raw) {
            Ok(mut task) => {
                // The file name is the identity; a stored id can drift from it.
                task.id = id.to_string();
                Ok(TaskRead::Found(task))
            }
            Err(e) => {
                tlog_debug!("read_task {}: malformed: {}", path.display(), e);
                Ok(TaskRead::Malformed)
            }
        }
    }

    /// Read a task. Missing and malformed files are both `None`.
    ///
    /// # Errors
    /// Only for an id that fails validation.
    pub fn read_task(&self, id: &str) -> Result<Option<TaskFile>> {
        Ok(self.read_task_entry(id)?.into_option())
    }

    /// Patch the fields set in `update`; every other field is preserved.
    ///
    /// # Errors
    /// Fails if the task file is missing, unparsable or not a JSON object.
    pub fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<()> {
        let path = self.task_path(id)?;
        let mut record: Map<String, Value> = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        let patch = match serde_json::to_value(update)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            record.insert(key, value);
        }

        atomic_write_json(&path, &record)
    }

    /// All task ids of the team, ordered by [`compare_task_ids`].
    ///
    /// Temp files and failure sidecars are skipped. A missing directory
    /// yields an empty list.
    pub fn list_task_ids(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| {
                name.ends_with(".json")
                    && !name.contains(TMP_MARKER)
                    && !name.ends_with(FAILURE_SUFFIX)
            })
            .filter_map(|name| name.strip_suffix(".json").map(String::from))
            .filter(|id| sanitize_task_id(id).is_ok())
            .collect();
        ids.sort_by(|a, b| compare_task_ids(a, b));
        ids
    }

    /// Every readable task, in id order.
    pub fn read_all_tasks(&self) -> Vec<TaskFile> {
        self.list_task_ids()
            .iter()
            .filter_map(|id| self.read_task(id).ok().flatten())
            .collect()
    }

    /// True iff every blocker exists and is completed. Empty is vacuously true.
    /// A missing, malformed or invalid blocker fails closed.
    pub fn are_blockers_resolved(&self, blocked_by: &[String]) -> bool {
        blocked_by.iter().all(|blocker| match self.read_task(blocker) {
            Ok(Some(task)) => task.status == TaskStatus::Completed,
            Ok(None) => false,
            Err(e) => {
                tlog_warn!("Ignoring invalid blocker id in team {}: {}", self.team, e);
                false
            }
        })
    }

    fn is_eligible(&self, task: &TaskFile, worker: &str) -> bool {
        task.status == TaskStatus::Pending
            && task.owner == worker
            && self.are_blockers_resolved(&task.blocked_by)
    }

    /// Find, claim and verify the next task for `worker`.
    ///
    /// Scans ids in order and skips tasks owned by someone else, tasks that
    /// are not pending and tasks with unresolved blockers. A lost claim
    /// moves the scan forward; it never restarts from the top.
    pub async fn find_next_task(&self, worker: &str) -> Result<Option<TaskFile>> {
        sanitize_name("worker name", worker)?;
        let identity = ClaimIdentity::new(worker);

        for id in self.list_task_ids() {
            let task = match self.read_task(&id)? {
                Some(task) => task,
                None => continue,
            };
            if !self.is_eligible(&task, worker) {
                continue;
            }

            if let Err(e) = self.update_task(&id, &identity.update()) {
                tlog_warn!("Failed to write claim on task {}: {}", id, e);
                continue;
            }

            tokio::time::sleep(self.claim_delay).await;

            match self.read_task(&id)? {
                Some(fresh) if identity.holds(&fresh) => {
                    tlog_debug!("Claimed task {} for {}", id, worker);
                    return Ok(Some(fresh));
                }
                Some(fresh) => {
                    tlog_warn!(
                        "Lost claim race on task {} (claimed by {:?}, status {})",
                        id,
                        fresh.claimed_by,
                        fresh.status
                    );
                }
                None => tlog_warn!("Task {} vanished during claim", id),
            }
        }

        Ok(None)
    }

    /// Record a failure, incrementing the retry count of an existing sidecar.
    pub fn write_task_failure(&self, id: &str, error: &str) -> Result<FailureSidecar> {
        let path = self.failure_path(id)?;
        let previous = read_json::<FailureSidecar>(&path);
        let sidecar = FailureSidecar {
            task_id: id.to_string(),
            last_error: error.to_string(),
            retry_count: previous.map(|f| f.retry_count + 1).unwrap_or(1),
            last_failed_at: Utc::now(),
        };
        atomic_write_json(&path, &sidecar)?;
        Ok(sidecar)
    }

    pub fn read_task_failure(&self, id: &str) -> Result<Option<FailureSidecar>> {
        Ok(read_json(&self.failure_path(id)?))
    }

    /// True iff a sidecar exists whose retry count reached `max_retries`.
    pub fn is_task_retry_exhausted(&self, id: &str, max_retries: u32) -> Result<bool> {
        Ok(self
            .read_task_failure(id)?
            .map(|f| f.retry_count >= max_retries)
            .unwrap_or(false))
    }

    /// Terminal failure: the task is completed and flagged so it is never
    /// picked up again.
    pub fn mark_permanently_failed(&self, id: &str, error: &str) -> Result<()> {
        let update = TaskUpdate::status(TaskStatus::Completed)
            .with_field("permanentlyFailed", Value::Bool(true))
            .with_field("failedAt", Value::String(Utc::now().to_rfc3339()))
            .with_field("lastError", Value::String(error.to_string()));
        self.update_task(id, &update)
    }
}
