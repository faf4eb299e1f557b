//! Crash-restart supervision tests.
//!
//! These run `supervise_once` against a fake session host, so they check
//! the decisions and the files they leave behind, not real processes.

use teambridge::audit::{AuditEventType, AuditFilter};
use teambridge::config::{validate_config_path, BridgeConfig, Provider};
use teambridge::heartbeat::{HeartbeatData, WorkerState};
use teambridge::registry::McpWorkerMember;
use teambridge::restart::RestartPolicy;
use teambridge::session::session_name;
use teambridge::supervisor::{supervise_once, SupervisorAction};

use crate::fixtures::{FakeSessionHost, TestWorkspace, TEAM};

use std::time::Duration;

const MAX_AGE: Duration = Duration::from_secs(30);

fn register(ws: &TestWorkspace, worker: &str) {
    let mut member = McpWorkerMember::new(worker, Provider::Gemini);
    member.cwd = Some(ws.path().to_path_buf());
    member.model = Some("gemini-2.5-pro".to_string());
    ws.team().registry.register(&member).unwrap();
}

fn only_action(reports: Vec<teambridge::supervisor::SupervisorReport>) -> SupervisorAction {
    assert_eq!(reports.len(), 1, "{reports:?}");
    reports.into_iter().next().unwrap().action
}

/// Test: Crashed worker is respawned from its registration
/// Given a registered worker with no heartbeat and no session
/// When the supervisor runs
/// Then a bridge is spawned with a config rebuilt from the registration
#[test]
fn test_dead_worker_is_restarted() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    let host = FakeSessionHost::default();
    register(&ws, "w1");

    let action = only_action(supervise_once(&team, &host, MAX_AGE).unwrap());
    let session = session_name(TEAM, "w1").unwrap();
    assert_eq!(
        action,
        SupervisorAction::Restarted {
            session: session.clone(),
            attempt: 1
        }
    );

    let spawned = host.spawned.lock().unwrap().clone();
    assert_eq!(spawned.len(), 1);
    let (name, cmd) = &spawned[0];
    assert_eq!(name, &session);
    assert_eq!(&cmd[1..3], &["run".to_string(), "--config".to_string()]);

    let config_path = ws.layout.bridge_config_path(TEAM, "w1").unwrap();
    assert_eq!(cmd[3], config_path.display().to_string());
    assert!(validate_config_path(&config_path, &ws.home()));
    let config = BridgeConfig::load(&config_path).unwrap();
    assert_eq!(config.provider, Provider::Gemini);
    assert_eq!(config.model.as_deref(), Some("gemini-2.5-pro"));
    assert_eq!(config.working_directory, ws.path());
    assert_eq!(config.tasks_root.as_deref(), Some(ws.layout.tasks_root()));

    let state = team.restarts.read_restart_state("w1").unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 1);

    let restarted = team.audit.read(&AuditFilter {
        event_type: Some(AuditEventType::WorkerRestarted),
        ..Default::default()
    });
    assert_eq!(restarted.len(), 1);
    assert_eq!(restarted[0].worker_name.as_deref(), Some("w1"));
}

/// Test: Restart lifecycle with backoff
/// Given a worker that was just restarted
/// When its session is still starting, then crashes again
/// Then the supervisor waits, then backs off instead of respawning
#[test]
fn test_restart_waits_for_startup_then_backs_off() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    let host = FakeSessionHost::default();
    register(&ws, "w1");

    supervise_once(&team, &host, MAX_AGE).unwrap();
    assert_eq!(
        only_action(supervise_once(&team, &host, MAX_AGE).unwrap()),
        SupervisorAction::Starting
    );

    host.crash(&session_name(TEAM, "w1").unwrap());
    match only_action(supervise_once(&team, &host, MAX_AGE).unwrap()) {
        SupervisorAction::BackingOff { remaining_ms } => {
            assert!(remaining_ms > 0 && remaining_ms <= 5_000, "{remaining_ms}")
        }
        other => panic!("expected backoff, got {other:?}"),
    }
    assert_eq!(host.spawn_count(), 1);
}

/// Test: Live worker stays untouched, then stabilizes
#[test]
fn test_live_worker_is_left_alone_and_stabilizes() {
    let ws = TestWorkspace::new();
    let host = FakeSessionHost::default();
    register(&ws, "w1");

    let team = ws.team();
    team.heartbeats.beat("w1", Some(1)).unwrap();
    assert_eq!(
        only_action(supervise_once(&team, &host, MAX_AGE).unwrap()),
        SupervisorAction::Healthy
    );

    let quick = ws.team_with_policy(RestartPolicy {
        stable_run_ms: 0,
        ..Default::default()
    });
    quick.restarts.record_restart("w1").unwrap();
    assert_eq!(
        only_action(supervise_once(&quick, &host, MAX_AGE).unwrap()),
        SupervisorAction::Stabilized
    );
    assert!(quick.restarts.read_restart_state("w1").unwrap().is_none());
    assert_eq!(host.spawn_count(), 0);
}

/// Test: Quarantined worker holding its session is replaced
#[test]
fn test_quarantined_worker_is_killed_and_restarted() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    let host = FakeSessionHost::default();
    register(&ws, "w1");

    let session = session_name(TEAM, "w1").unwrap();
    host.mark_alive(&session);
    let mut beat = HeartbeatData::new(TEAM, "w1");
    beat.state = WorkerState::Quarantined;
    team.heartbeats.write(&beat).unwrap();

    let action = only_action(supervise_once(&team, &host, MAX_AGE).unwrap());
    assert!(matches!(action, SupervisorAction::Restarted { attempt: 1, .. }));
    assert_eq!(host.killed.lock().unwrap().as_slice(), &[session]);
    assert!(team.heartbeats.read("w1").unwrap().is_none());
}

/// Test: Too many restarts abandon the worker
/// Given a worker already restarted up to the policy limit
/// When it is found dead again
/// Then it is torn down and no longer registered
#[test]
fn test_worker_abandoned_after_max_restarts() {
    let ws = TestWorkspace::new();
    let team = ws.team_with_policy(RestartPolicy {
        max_consecutive_failures: 2,
        backoff_base_ms: 0,
        ..Default::default()
    });
    let host = FakeSessionHost::default();
    register(&ws, "w1");
    let session = session_name(TEAM, "w1").unwrap();

    for attempt in 1..=2 {
        let action = only_action(supervise_once(&team, &host, MAX_AGE).unwrap());
        assert!(
            matches!(action, SupervisorAction::Restarted { attempt: a, .. } if a == attempt),
            "{action:?}"
        );
        host.crash(&session);
    }

    assert_eq!(
        only_action(supervise_once(&team, &host, MAX_AGE).unwrap()),
        SupervisorAction::Abandoned { failures: 2 }
    );
    assert!(!team.registry.is_registered("w1"));
    assert!(team.restarts.read_restart_state("w1").unwrap().is_none());
    assert!(supervise_once(&team, &host, MAX_AGE).unwrap().is_empty());

    let abandoned = team.audit.read(&AuditFilter {
        event_type: Some(AuditEventType::WorkerAbandoned),
        ..Default::default()
    });
    assert_eq!(abandoned.len(), 1);
}
