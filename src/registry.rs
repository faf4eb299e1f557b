//! Worker registration and cached capability probes.
//!
//! Each worker writes only its own registration file, so registering never
//! races with a sibling worker rewriting a shared roster.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Layout, Provider};
use crate::fs_util::{atomic_write_json, read_json, remove_if_exists, sanitize_name, TMP_MARKER};
use crate::{tlog_debug, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpWorkerMember {
    pub name: String,
    /// `mcp-<provider>`.
    pub agent_type: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl McpWorkerMember {
    pub fn new(name: &str, provider: Provider) -> Self {
        Self {
            name: name.to_string(),
            agent_type: provider.agent_type(),
            registered_at: Utc::now(),
            cwd: None,
            model: None,
        }
    }

    /// Provider name with the `mcp-` prefix stripped.
    pub fn provider(&self) -> &str {
        self.agent_type
            .strip_prefix("mcp-")
            .unwrap_or(&self.agent_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Pass,
    Fail,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub probe_result: ProbeOutcome,
    pub probed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ProbeResult {
    pub fn new(outcome: ProbeOutcome, version: Option<String>) -> Self {
        Self {
            probe_result: outcome,
            probed_at: Utc::now(),
            version,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    team: String,
    dir: PathBuf,
}

impl WorkerRegistry {
    pub fn new(layout: &Layout, team: &str) -> Result<Self> {
        Ok(Self {
            team: team.to_string(),
            dir: layout.team_state_dir(team)?,
        })
    }

    fn member_path(&self, worker: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join("workers")
            .join(format!("{}.json", sanitize_name("worker name", worker)?)))
    }

    fn probe_path(&self, provider: Provider) -> PathBuf {
        self.dir.join(format!("probe-{}.json", provider.as_str()))
    }

    pub fn register(&self, member: &McpWorkerMember) -> Result<()> {
        atomic_write_json(&self.member_path(&member.name)?, member)?;
        tlog_debug!(
            "Registered worker {}/{} as {}",
            self.team,
            member.name,
            member.agent_type
        );
        Ok(())
    }

    pub fn unregister(&self, worker: &str) -> Result<bool> {
        let removed = remove_if_exists(&self.member_path(worker)?)?;
        if removed {
            tlog_debug!("Unregistered worker {}/{}", self.team, worker);
        }
        Ok(removed)
    }

    pub fn is_registered(&self, worker: &str) -> bool {
        self.get(worker).ok().flatten().is_some()
    }

    pub fn get(&self, worker: &str) -> Result<Option<McpWorkerMember>> {
        Ok(read_json(&self.member_path(worker)?))
    }

    /// All registered workers, sorted by name.
    pub fn list(&self) -> Vec<McpWorkerMember> {
        let entries = match fs::read_dir(self.dir.join("workers")) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut members: Vec<McpWorkerMember> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                let name = p.to_string_lossy();
                name.ends_with(".json") && !name.contains(TMP_MARKER)
            })
            .filter_map(|p| read_json(&p))
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Cached probe for `provider`, shared by every worker of the team.
    pub fn read_probe_result(&self, provider: Provider) -> Option<ProbeResult> {
        read_json(&self.probe_path(provider))
    }

    pub fn write_probe_result(&self, provider: Provider, result: &ProbeResult) -> Result<()> {
        atomic_write_json(&self.probe_path(provider), result)
    }
}
