//! Per-worker health reports for monitors.

use std::time::Duration;

use serde::Serialize;

use crate::heartbeat::WorkerState;
use crate::team::Team;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthIssue {
    NoHeartbeat,
    StaleHeartbeat { age_ms: u64 },
    Quarantined,
    ConsecutiveErrors { count: u32 },
}

impl std::fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthIssue::NoHeartbeat => write!(f, "no heartbeat"),
            HealthIssue::StaleHeartbeat { age_ms } => write!(f, "stale heartbeat ({age_ms}ms)"),
            HealthIssue::Quarantined => write!(f, "quarantined"),
            HealthIssue::ConsecutiveErrors { count } => write!(f, "{count} consecutive errors"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealthReport {
    pub worker_name: String,
    pub is_alive: bool,
    pub heartbeat_age_ms: Option<u64>,
    pub state: Option<WorkerState>,
    pub consecutive_errors: u32,
    pub current_task_id: Option<String>,
    pub restart_count: u32,
    pub issues: Vec<HealthIssue>,
}

impl WorkerHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn check_worker_health(team: &Team, worker: &str, max_age: Duration) -> Result<WorkerHealthReport> {
    let beat = team.heartbeats.read(worker)?;
    let restart_count = team
        .restarts
        .read_restart_state(worker)?
        .map(|s| s.consecutive_failures)
        .unwrap_or(0);

    let mut report = WorkerHealthReport {
        worker_name: worker.to_string(),
        is_alive: false,
        heartbeat_age_ms: None,
        state: None,
        consecutive_errors: 0,
        current_task_id: None,
        restart_count,
        issues: Vec::new(),
    };

    let Some(beat) = beat else {
        report.issues.push(HealthIssue::NoHeartbeat);
        return Ok(report);
    };

    let age = beat.age();
    report.heartbeat_age_ms = Some(age.as_millis() as u64);
    report.is_alive = age <= max_age;
    report.state = Some(beat.state);
    report.consecutive_errors = beat.consecutive_errors;
    report.current_task_id = beat.current_task_id;

    if !report.is_alive {
        report.issues.push(HealthIssue::StaleHeartbeat {
            age_ms: age.as_millis() as u64,
        });
    }
    if beat.state == WorkerState::Quarantined {
        report.issues.push(HealthIssue::Quarantined);
    }
    if beat.consecutive_errors > 0 {
        report.issues.push(HealthIssue::ConsecutiveErrors {
            count: beat.consecutive_errors,
        });
    }
    Ok(report)
}

/// Reports for every registered worker. Workers whose files cannot be read
/// are skipped rather than failing the whole list.
pub fn worker_health_reports(team: &Team, max_age: Duration) -> Vec<WorkerHealthReport> {
    team.registry
        .list()
        .iter()
        .filter_map(|m| check_worker_health(team, &m.name, max_age).ok())
        .collect()
}
