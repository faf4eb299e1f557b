//! Per-worker liveness beacons.
//!
//! A heartbeat is a single file per worker, overwritten on every beat. It is
//! a liveness signal, not a log. Only the owning worker writes it.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Layout;
use crate::fs_util::{atomic_write_json, read_json, remove_if_exists, sanitize_name, TMP_MARKER};
use crate::{tlog_debug, Result};

/// What a worker reports it is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Starting,
    Idle,
    Polling,
    Executing,
    Reporting,
    Draining,
    ShuttingDown,
    Quarantined,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Polling => "polling",
            WorkerState::Executing => "executing",
            WorkerState::Reporting => "reporting",
            WorkerState::Draining => "draining",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Quarantined => "quarantined",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub worker_name: String,
    pub team_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub consecutive_errors: u32,
}

impl HeartbeatData {
    pub fn new(team_name: &str, worker_name: &str) -> Self {
        Self {
            worker_name: worker_name.to_string(),
            team_name: team_name.to_string(),
            timestamp: Utc::now(),
            pid: None,
            provider: None,
            state: WorkerState::default(),
            current_task_id: None,
            consecutive_errors: 0,
        }
    }

    /// Time since the beat, clamped at zero for clocks that moved backwards.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Heartbeat files of one team.
#[derive(Debug, Clone)]
pub struct HeartbeatRegistry {
    team: String,
    dir: PathBuf,
}

impl HeartbeatRegistry {
    pub fn new(layout: &Layout, team: &str) -> Result<Self> {
        Ok(Self {
            team: team.to_string(),
            dir: layout.team_state_dir(team)?.join("heartbeats"),
        })
    }

    fn path(&self, worker: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join(format!("{}.json", sanitize_name("worker name", worker)?)))
    }

    /// Overwrite the worker's beacon. The timestamp is stamped here.
    pub fn write(&self, data: &HeartbeatData) -> Result<()> {
        let path = self.path(&data.worker_name)?;
        let mut data = data.clone();
        data.team_name = self.team.clone();
        data.timestamp = Utc::now();
        atomic_write_json(&path, &data)
    }

    /// Minimal beat: name, time and pid.
    pub fn beat(&self, worker: &str, pid: Option<u32>) -> Result<()> {
        let mut data = HeartbeatData::new(&self.team, worker);
        data.pid = pid;
        self.write(&data)
    }

    pub fn read(&self, worker: &str) -> Result<Option<HeartbeatData>> {
        Ok(read_json(&self.path(worker)?))
    }

    /// Every readable heartbeat of the team, sorted by worker name.
    pub fn list(&self) -> Vec<HeartbeatData> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut beats: Vec<HeartbeatData> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                let name = p.to_string_lossy();
                name.ends_with(".json") && !name.contains(TMP_MARKER)
            })
            .filter_map(|p| read_json(&p))
            .collect();
        beats.sort_by(|a, b| a.worker_name.cmp(&b.worker_name));
        beats
    }

    /// Alive iff a beacon exists and is no older than `max_age`.
    pub fn is_worker_alive(&self, worker: &str, max_age: Duration) -> bool {
        match self.read(worker) {
            Ok(Some(beat)) => beat.age() <= max_age,
            _ => false,
        }
    }

    /// Remove the beacon so departure is visible immediately.
    pub fn delete(&self, worker: &str) -> Result<bool> {
        let removed = remove_if_exists(&self.path(worker)?)?;
        tlog_debug!("Deleted heartbeat for {}/{}: {}", self.team, worker, removed);
        Ok(removed)
    }

    /// Remove every beacon of the team. Returns how many were removed.
    pub fn cleanup_team(&self) -> Result<usize> {
        let mut removed = 0;
        for beat in self.list() {
            if self.delete(&beat.worker_name)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
