//! Read-only team snapshot for monitors.
//!
//! Every field is read independently while workers keep writing, so counts
//! can be transiently inconsistent across one in-flight transition. The
//! snapshot is for display, not for control decisions. Nothing here mutates
//! state: outbox messages are peeked, not consumed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::graph::analyze_blockers;
use crate::heartbeat::HeartbeatData;
use crate::mailbox::OutboxMessage;
use crate::task::{TaskFile, TaskStatus};
use crate::team::Team;
use crate::tlog_debug;

/// Most outbox messages carried per worker.
pub const MAX_RECENT_MESSAGES: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    /// Permanently failed. Not included in `completed`.
    pub failed: usize,
    pub pending: usize,
    pub in_progress: usize,
}

impl TaskStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a TaskFile>) -> Self {
        let mut stats = Self::default();
        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Completed if task.is_permanently_failed() => stats.failed += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Unknown => {}
            }
        }
        stats
    }

    /// Nothing left to run.
    pub fn is_done(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub worker_name: String,
    pub provider: String,
    pub heartbeat: Option<HeartbeatData>,
    pub is_alive: bool,
    pub current_task: Option<TaskFile>,
    pub recent_messages: Vec<OutboxMessage>,
    pub task_stats: TaskStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamPhase {
    /// No tasks at all.
    Empty,
    Running,
    /// Work remains but no worker is alive to do it.
    Stalled,
    Completed,
    CompletedWithFailures,
}

impl std::fmt::Display for TeamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TeamPhase::Empty => "empty",
            TeamPhase::Running => "running",
            TeamPhase::Stalled => "stalled",
            TeamPhase::Completed => "completed",
            TeamPhase::CompletedWithFailures => "completed with failures",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamStatus {
    pub team_name: String,
    pub phase: TeamPhase,
    pub workers: Vec<WorkerStatus>,
    pub task_summary: TaskStats,
    /// Tasks that can never become eligible (blocker cycles or missing blockers).
    pub stuck_tasks: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

fn phase(summary: &TaskStats, any_alive: bool) -> TeamPhase {
    if summary.total == 0 {
        TeamPhase::Empty
    } else if summary.is_done() && summary.failed > 0 {
        TeamPhase::CompletedWithFailures
    } else if summary.is_done() {
        TeamPhase::Completed
    } else if any_alive {
        TeamPhase::Running
    } else {
        TeamPhase::Stalled
    }
}

/// Compose a snapshot of the team. Never fails: unreadable pieces are
/// reported as absent.
pub fn get_team_status(team: &Team, heartbeat_max_age: Duration) -> TeamStatus {
    let tasks = team.tasks.read_all_tasks();
    let members = team.registry.list();

    let workers: Vec<WorkerStatus> = members
        .iter()
        .map(|member| {
            let heartbeat = team.heartbeats.read(&member.name).ok().flatten();
            let is_alive = heartbeat
                .as_ref()
                .is_some_and(|b| b.age() <= heartbeat_max_age);
            let mut recent_messages = team
                .mailbox
                .peek_new_outbox_messages(&member.name)
                .unwrap_or_default();
            if recent_messages.len() > MAX_RECENT_MESSAGES {
                recent_messages.drain(..recent_messages.len() - MAX_RECENT_MESSAGES);
            }
            let owned: Vec<&TaskFile> = tasks.iter().filter(|t| t.owner == member.name).collect();
            let current_task = owned
                .iter()
                .find(|t| t.status == TaskStatus::InProgress)
                .map(|t| (*t).clone());

            WorkerStatus {
                worker_name: member.name.clone(),
                provider: member.provider().to_string(),
                heartbeat,
                is_alive,
                current_task,
                recent_messages,
                task_stats: TaskStats::from_tasks(owned),
            }
        })
        .collect();

    let task_summary = TaskStats::from_tasks(&tasks);
    let any_alive = workers.iter().any(|w| w.is_alive);
    let stuck_tasks = analyze_blockers(&tasks)
        .stuck_tasks()
        .into_iter()
        .filter(|id| {
            tasks
                .iter()
                .any(|t| &t.id == id && t.status == TaskStatus::Pending)
        })
        .collect();

    tlog_debug!(
        "Team status {}: {} workers, {} tasks",
        team.name(),
        workers.len(),
        task_summary.total
    );

    TeamStatus {
        team_name: team.name().to_string(),
        phase: phase(&task_summary, any_alive),
        workers,
        task_summary,
        stuck_tasks,
        last_updated: Utc::now(),
    }
}
