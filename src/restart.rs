//! Crash-restart bookkeeping for bridge workers.
//!
//! The bridge never retries itself after a fatal condition; it exits and the
//! supervisor consults this module to decide whether and when to respawn.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BridgeConfig, Layout, Provider};
use crate::fs_util::{atomic_write_json, read_json, remove_if_exists, sanitize_name};
use crate::registry::McpWorkerMember;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestartPolicy {
    /// Give up after this many restarts without a stable run in between.
    pub max_consecutive_failures: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// A worker alive this long after its last restart is considered healthy
    /// again and its failure count is cleared.
    pub stable_run_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            backoff_base_ms: 5_000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
            stable_run_ms: 300_000,
        }
    }
}

impl RestartPolicy {
    /// Backoff required before restart number `failures + 1`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(32) as i32;
        let ms = self.backoff_base_ms as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.backoff_max_ms as f64) as u64)
    }

    pub fn stable_run(&self) -> Duration {
        Duration::from_millis(self.stable_run_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestartState {
    pub consecutive_failures: u32,
    pub last_restart_at: DateTime<Utc>,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Now,
    /// Still inside the backoff window.
    Wait(Duration),
    GiveUp,
}

/// Decide what to do about a dead worker.
pub fn should_restart(state: Option<&RestartState>, policy: &RestartPolicy) -> RestartDecision {
    should_restart_at(state, policy, Utc::now())
}

pub fn should_restart_at(
    state: Option<&RestartState>,
    policy: &RestartPolicy,
    now: DateTime<Utc>,
) -> RestartDecision {
    let Some(state) = state else {
        return RestartDecision::Now;
    };
    if state.consecutive_failures >= policy.max_consecutive_failures {
        return RestartDecision::GiveUp;
    }
    let elapsed = (now - state.last_restart_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    let backoff = Duration::from_millis(state.backoff_ms);
    if elapsed >= backoff {
        RestartDecision::Now
    } else {
        RestartDecision::Wait(backoff - elapsed)
    }
}

/// Restart state files of one team.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    dir: PathBuf,
    policy: RestartPolicy,
}

impl RestartTracker {
    pub fn new(layout: &Layout, team: &str, policy: RestartPolicy) -> Result<Self> {
        Ok(Self {
            dir: layout.team_state_dir(team)?.join("restart"),
            policy,
        })
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    fn path(&self, worker: &str) -> Result<PathBuf> {
        Ok(self
            .dir
            .join(format!("{}.json", sanitize_name("worker name", worker)?)))
    }

    pub fn read_restart_state(&self, worker: &str) -> Result<Option<RestartState>> {
        Ok(read_json(&self.path(worker)?))
    }

    pub fn should_restart(&self, worker: &str) -> Result<RestartDecision> {
        Ok(should_restart(
            self.read_restart_state(worker)?.as_ref(),
            &self.policy,
        ))
    }

    /// Count one more restart and schedule the next backoff.
    pub fn record_restart(&self, worker: &str) -> Result<RestartState> {
        let failures = self
            .read_restart_state(worker)?
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
            + 1;
        let state = RestartState {
            consecutive_failures: failures,
            last_restart_at: Utc::now(),
            backoff_ms: self.policy.backoff_for(failures).as_millis() as u64,
        };
        atomic_write_json(&self.path(worker)?, &state)?;
        Ok(state)
    }

    pub fn clear_restart_state(&self, worker: &str) -> Result<bool> {
        remove_if_exists(&self.path(worker)?)
    }
}

/// Rebuild a runnable bridge config from a registration alone.
pub fn synthesize_bridge_config(
    team: &str,
    member: &McpWorkerMember,
    layout: &Layout,
) -> Result<BridgeConfig> {
    sanitize_name("team name", team)?;
    sanitize_name("worker name", &member.name)?;
    let provider: Provider = member.provider().parse()?;
    let work_dir = member
        .cwd
        .clone()
        .unwrap_or_else(|| layout.work_dir().to_path_buf());
    let mut config = BridgeConfig::new(team, &member.name, provider, work_dir);
    config.model = member.model.clone();
    config.tasks_root = Some(layout.tasks_root().to_path_buf());
    Ok(config)
}
