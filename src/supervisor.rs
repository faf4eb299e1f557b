//! One pass of crash-restart supervision over a team.
//!
//! A worker that left gracefully has unregistered itself, so only crashed
//! or quarantined workers are still registered without a live heartbeat.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::audit::{AuditEvent, AuditEventType};
use crate::heartbeat::WorkerState;
use crate::restart::{synthesize_bridge_config, RestartDecision};
use crate::session::{session_name, spawn_bridge_in_session, SessionHost};
use crate::team::Team;
use crate::{tlog, tlog_warn, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SupervisorAction {
    Healthy,
    /// Alive long enough after a restart that its failure count was reset.
    Stabilized,
    /// Session is up but the bridge has not written its first heartbeat.
    Starting,
    Restarted { session: String, attempt: u32 },
    BackingOff { remaining_ms: u64 },
    Abandoned { failures: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorReport {
    pub worker_name: String,
    #[serde(flatten)]
    pub action: SupervisorAction,
}

/// Inspect every registered worker once and restart, back off or abandon
/// the dead ones.
pub fn supervise_once(
    team: &Team,
    host: &dyn SessionHost,
    heartbeat_max_age: Duration,
) -> Result<Vec<SupervisorReport>> {
    let mut reports = Vec::new();
    for member in team.registry.list() {
        let worker = member.name.clone();
        let action = supervise_worker(team, host, heartbeat_max_age, &member)?;
        reports.push(SupervisorReport {
            worker_name: worker,
            action,
        });
    }
    Ok(reports)
}

fn supervise_worker(
    team: &Team,
    host: &dyn SessionHost,
    heartbeat_max_age: Duration,
    member: &crate::registry::McpWorkerMember,
) -> Result<SupervisorAction> {
    let worker = member.name.as_str();
    let session = session_name(team.name(), worker)?;
    let beat = team.heartbeats.read(worker)?;
    let session_alive = host.is_session_alive(&session);

    let alive = beat
        .as_ref()
        .is_some_and(|b| b.age() <= heartbeat_max_age && b.state != WorkerState::Quarantined);

    if alive {
        if let Some(state) = team.restarts.read_restart_state(worker)? {
            let since = (Utc::now() - state.last_restart_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if since >= team.restarts.policy().stable_run() {
                team.restarts.clear_restart_state(worker)?;
                tlog!("Worker {} stable again, restart count cleared", worker);
                return Ok(SupervisorAction::Stabilized);
            }
        }
        return Ok(SupervisorAction::Healthy);
    }

    if session_alive && beat.is_none() {
        return Ok(SupervisorAction::Starting);
    }

    match team.restarts.should_restart(worker)? {
        RestartDecision::Wait(remaining) => Ok(SupervisorAction::BackingOff {
            remaining_ms: remaining.as_millis() as u64,
        }),
        RestartDecision::GiveUp => {
            let failures = team
                .restarts
                .read_restart_state(worker)?
                .map(|s| s.consecutive_failures)
                .unwrap_or(0);
            tlog_warn!("Abandoning worker {} after {} restarts", worker, failures);
            if session_alive {
                host.kill_session(&session)?;
            }
            team.audit.record(
                AuditEvent::new(AuditEventType::WorkerAbandoned, team.name())
                    .worker(worker)
                    .details(json!({ "consecutiveFailures": failures })),
            );
            team.teardown_worker(worker)?;
            Ok(SupervisorAction::Abandoned { failures })
        }
        RestartDecision::Now => {
            if session_alive {
                // Hung or quarantined bridge still holding its session.
                host.kill_session(&session)?;
            }
            let config = synthesize_bridge_config(team.name(), member, team.layout())?;
            team.heartbeats.delete(worker)?;
            let session = spawn_bridge_in_session(host, team.layout(), &config)?;
            let state = team.restarts.record_restart(worker)?;
            tlog!(
                "Restarted worker {} in {} (attempt {})",
                worker,
                session,
                state.consecutive_failures
            );
            team.audit.record(
                AuditEvent::new(AuditEventType::WorkerRestarted, team.name())
                    .worker(worker)
                    .details(json!({
                        "session": session,
                        "attempt": state.consecutive_failures,
                        "nextBackoffMs": state.backoff_ms,
                    })),
            );
            Ok(SupervisorAction::Restarted {
                session,
                attempt: state.consecutive_failures,
            })
        }
    }
}
