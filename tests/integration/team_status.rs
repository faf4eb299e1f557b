//! Monitor snapshot and health report tests.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use teambridge::config::Provider;
use teambridge::health::{check_worker_health, worker_health_reports, HealthIssue};
use teambridge::heartbeat::{HeartbeatData, WorkerState};
use teambridge::mailbox::{OutboxMessage, OutboxMessageType};
use teambridge::registry::McpWorkerMember;
use teambridge::status::{get_team_status, TeamPhase, MAX_RECENT_MESSAGES};

use crate::fixtures::{pending_task, TestWorkspace, TEAM};

const MAX_AGE: Duration = Duration::from_secs(30);

fn write_stale_heartbeat(ws: &TestWorkspace, worker: &str, age: chrono::Duration) {
    let mut beat = HeartbeatData::new(TEAM, worker);
    beat.timestamp = Utc::now() - age;
    let dir = ws
        .layout
        .team_state_dir(TEAM)
        .unwrap()
        .join("heartbeats");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{worker}.json")),
        serde_json::to_string(&beat).unwrap(),
    )
    .unwrap();
}

/// Test: Snapshot of a team mid-run
/// Given one live worker with work in flight and one dead worker
/// When a monitor takes a snapshot
/// Then counts, liveness, current task and stuck tasks are reported
#[test]
fn test_status_snapshot() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    team.registry
        .register(&McpWorkerMember::new("w1", Provider::Claude))
        .unwrap();
    team.registry
        .register(&McpWorkerMember::new("w2", Provider::Gemini))
        .unwrap();
    team.heartbeats.beat("w1", Some(4242)).unwrap();

    ws.write_task("1", json!({"id": "1", "owner": "w1", "status": "completed"}));
    ws.write_task("2", json!({"id": "2", "owner": "w1", "status": "in_progress"}));
    ws.write_task(
        "3",
        json!({"id": "3", "owner": "w1", "status": "completed", "permanentlyFailed": true}),
    );
    ws.write_task("4", pending_task("4", "w2", &["99"]));
    ws.write_task("5", pending_task("5", "w2", &["6"]));
    ws.write_task("6", pending_task("6", "w2", &["5"]));

    let status = get_team_status(&team, MAX_AGE);

    assert_eq!(status.team_name, TEAM);
    assert_eq!(status.phase, TeamPhase::Running);
    assert_eq!(status.task_summary.total, 6);
    assert_eq!(status.task_summary.completed, 1);
    assert_eq!(status.task_summary.failed, 1);
    assert_eq!(status.task_summary.in_progress, 1);
    assert_eq!(status.task_summary.pending, 3);
    assert_eq!(status.stuck_tasks, vec!["4", "5", "6"]);

    let w1 = &status.workers[0];
    assert_eq!(w1.worker_name, "w1");
    assert_eq!(w1.provider, "claude");
    assert!(w1.is_alive);
    assert_eq!(w1.current_task.as_ref().map(|t| t.id.as_str()), Some("2"));
    assert_eq!(w1.task_stats.total, 3);

    let w2 = &status.workers[1];
    assert_eq!(w2.worker_name, "w2");
    assert!(!w2.is_alive);
    assert!(w2.heartbeat.is_none());
    assert!(w2.current_task.is_none());
}

/// Test: Snapshots never consume outbox messages
#[test]
fn test_status_does_not_consume_outbox() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    team.registry
        .register(&McpWorkerMember::new("w1", Provider::Codex))
        .unwrap();
    for i in 0..MAX_RECENT_MESSAGES + 5 {
        team.mailbox
            .append_outbox(
                "w1",
                &OutboxMessage::new(OutboxMessageType::Heartbeat).message(i.to_string()),
            )
            .unwrap();
    }

    let first = get_team_status(&team, MAX_AGE);
    let second = get_team_status(&team, MAX_AGE);
    let recent = &first.workers[0].recent_messages;
    assert_eq!(recent.len(), MAX_RECENT_MESSAGES);
    assert_eq!(recent[0].message.as_deref(), Some("5"));
    assert_eq!(second.workers[0].recent_messages.len(), MAX_RECENT_MESSAGES);

    let unread = team.mailbox.read_new_outbox_messages("w1").unwrap();
    assert_eq!(unread.len(), MAX_RECENT_MESSAGES + 5);
}

/// Test: Phases of finished and abandoned teams
#[test]
fn test_status_phases() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    assert_eq!(get_team_status(&team, MAX_AGE).phase, TeamPhase::Empty);

    ws.write_task("1", pending_task("1", "w1", &[]));
    assert_eq!(get_team_status(&team, MAX_AGE).phase, TeamPhase::Stalled);

    ws.write_task("1", json!({"id": "1", "owner": "w1", "status": "completed"}));
    assert_eq!(get_team_status(&team, MAX_AGE).phase, TeamPhase::Completed);

    ws.write_task(
        "2",
        json!({"id": "2", "owner": "w1", "status": "completed", "permanentlyFailed": true}),
    );
    assert_eq!(
        get_team_status(&team, MAX_AGE).phase,
        TeamPhase::CompletedWithFailures
    );
}

/// Test: Health issues per worker
/// Given a healthy, a stale, a quarantined and a silent worker
/// When health is checked
/// Then each gets the matching issues
#[test]
fn test_health_reports() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    for name in ["w1", "w2", "w3", "w4"] {
        team.registry
            .register(&McpWorkerMember::new(name, Provider::Codex))
            .unwrap();
    }
    team.heartbeats.beat("w1", None).unwrap();
    write_stale_heartbeat(&ws, "w2", chrono::Duration::minutes(5));
    let mut quarantined = HeartbeatData::new(TEAM, "w3");
    quarantined.state = WorkerState::Quarantined;
    quarantined.consecutive_errors = 3;
    team.heartbeats.write(&quarantined).unwrap();
    team.restarts.record_restart("w3").unwrap();

    let reports = worker_health_reports(&team, MAX_AGE);
    assert_eq!(reports.len(), 4);

    assert!(reports[0].is_healthy());
    assert!(reports[0].is_alive);

    assert!(!reports[1].is_alive);
    assert!(matches!(
        reports[1].issues.as_slice(),
        [HealthIssue::StaleHeartbeat { .. }]
    ));

    assert_eq!(
        reports[2].issues,
        vec![
            HealthIssue::Quarantined,
            HealthIssue::ConsecutiveErrors { count: 3 }
        ]
    );
    assert_eq!(reports[2].restart_count, 1);

    assert_eq!(reports[3].issues, vec![HealthIssue::NoHeartbeat]);

    let single = check_worker_health(&team, "w1", MAX_AGE).unwrap();
    assert_eq!(single.state, Some(WorkerState::Starting));
}
