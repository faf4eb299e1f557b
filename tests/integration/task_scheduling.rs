//! Task claiming and ordering tests.
//!
//! These drive `TaskStore::find_next_task` against real task files and
//! check which task a worker gets and what the claim leaves on disk.

use serde_json::json;

use teambridge::config::Layout;
use teambridge::task::{TaskStatus, TaskStore, TaskUpdate};
use teambridge::Error;

use crate::fixtures::{pending_task, TestWorkspace};

/// Test: Blocked task becomes eligible once its blocker completes
/// Given task 2 blocked by task 1, both owned by w1
/// When w1 finishes task 1
/// Then the next claim returns task 2
#[tokio::test]
async fn test_blocked_task_follows_its_blocker() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    ws.write_task("1", pending_task("1", "w1", &[]));
    ws.write_task("2", pending_task("2", "w1", &["1"]));

    let first = team.tasks.find_next_task("w1").await.unwrap().unwrap();
    assert_eq!(first.id, "1");
    assert_eq!(first.claimed_by.as_deref(), Some("w1"));

    team.tasks
        .update_task("1", &TaskUpdate::status(TaskStatus::InProgress))
        .unwrap();
    assert!(
        team.tasks.find_next_task("w1").await.unwrap().is_none(),
        "task 2 must wait while task 1 is in progress"
    );

    team.tasks
        .update_task("1", &TaskUpdate::status(TaskStatus::Completed))
        .unwrap();
    let second = team.tasks.find_next_task("w1").await.unwrap().unwrap();
    assert_eq!(second.id, "2");
}

/// Test: Numeric ids sort numerically and before everything else
#[tokio::test]
async fn test_numeric_ids_are_claimed_first_in_numeric_order() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    for id in ["setup", "10", "2"] {
        ws.write_task(id, pending_task(id, "w1", &[]));
    }

    assert_eq!(team.tasks.list_task_ids(), vec!["2", "10", "setup"]);
    let next = team.tasks.find_next_task("w1").await.unwrap().unwrap();
    assert_eq!(next.id, "2");
}

/// Test: Only pending tasks owned by the worker are eligible
#[tokio::test]
async fn test_skips_foreign_and_non_pending_tasks() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    ws.write_task("1", pending_task("1", "w2", &[]));
    ws.write_task(
        "2",
        json!({"id": "2", "owner": "w1", "status": "in_progress"}),
    );
    ws.write_task("3", json!({"id": "3", "owner": "w1", "status": "completed"}));
    ws.write_task("4", json!({"id": "4", "owner": "w1", "status": "archived"}));
    ws.write_task("5", pending_task("5", "w1", &[]));

    let next = team.tasks.find_next_task("w1").await.unwrap().unwrap();
    assert_eq!(next.id, "5");
    assert!(team.tasks.find_next_task("w3").await.unwrap().is_none());
}

/// Test: Missing or malformed blockers fail closed
#[tokio::test]
async fn test_unresolvable_blockers_keep_task_ineligible() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    ws.write_task("1", pending_task("1", "w1", &["99"]));
    ws.write_task("2", pending_task("2", "w1", &["bad"]));
    std::fs::write(ws.tasks_dir().join("bad.json"), "{ not json").unwrap();
    ws.write_task("3", pending_task("3", "w1", &["../etc/passwd"]));

    assert!(team.tasks.find_next_task("w1").await.unwrap().is_none());
}

/// Test: Claim metadata is written and unknown fields survive
#[tokio::test]
async fn test_claim_preserves_unknown_fields() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    let mut task = pending_task("1", "w1", &[]);
    task["metadata"] = json!({"priority": "high"});
    task["activeForm"] = json!("Doing task 1");
    ws.write_task("1", task);

    let claimed = team.tasks.find_next_task("w1").await.unwrap().unwrap();
    assert_eq!(claimed.claim_pid, Some(std::process::id()));
    assert!(claimed.claim_token.is_some());
    assert!(claimed.claimed_at.is_some());

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(ws.tasks_dir().join("1.json")).unwrap())
            .unwrap();
    assert_eq!(raw["metadata"]["priority"], "high");
    assert_eq!(raw["activeForm"], "Doing task 1");
    assert_eq!(raw["claimedBy"], "w1");
    assert_eq!(raw["status"], "pending");
}

/// Test: Temp files and failure sidecars are not tasks
#[tokio::test]
async fn test_listing_ignores_temp_files_and_sidecars() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    ws.write_task("1", pending_task("1", "w1", &[]));
    team.tasks.write_task_failure("1", "boom").unwrap();
    std::fs::write(ws.tasks_dir().join("2.json.tmp.123.abcd1234"), "{}").unwrap();
    std::fs::write(ws.tasks_dir().join("notes.txt"), "hello").unwrap();

    assert_eq!(team.tasks.list_task_ids(), vec!["1"]);
}

/// Test: Retry budget turns into a permanent failure
#[test]
fn test_retry_exhaustion_marks_permanent_failure() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    ws.write_task("7", pending_task("7", "w1", &[]));

    for attempt in 1..=3 {
        let sidecar = team.tasks.write_task_failure("7", "agent crashed").unwrap();
        assert_eq!(sidecar.retry_count, attempt);
    }
    assert!(!team.tasks.is_task_retry_exhausted("7", 4).unwrap());
    assert!(team.tasks.is_task_retry_exhausted("7", 3).unwrap());

    team.tasks.mark_permanently_failed("7", "agent crashed").unwrap();
    let task = team.tasks.read_task("7").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.is_permanently_failed());
    assert_eq!(task.extra["lastError"], "agent crashed");
}

/// Test: A team name outside the allow-list never reaches the filesystem
#[test]
fn test_team_name_traversal_is_rejected() {
    let ws = TestWorkspace::new();
    let layout = Layout::new(ws.path().join("tasks"), ws.path());
    for bad in ["../escape", "a/b", "", "team name"] {
        let err = TaskStore::new(&layout, bad).unwrap_err();
        assert!(
            matches!(err, Error::InvalidName { .. }),
            "{bad:?} gave {err:?}"
        );
    }
}

/// Test: Updating a missing task is an error, reading one is not
#[test]
fn test_missing_task_update_fails() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    assert!(team.tasks.read_task("42").unwrap().is_none());
    let err = team
        .tasks
        .update_task("42", &TaskUpdate::status(TaskStatus::Completed))
        .unwrap_err();
    assert!(matches!(err, Error::TaskNotFound(_)));
}
