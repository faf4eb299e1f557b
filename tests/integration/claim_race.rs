//! Concurrent claim tests.
//!
//! Two claimants for the same worker name model a respawned bridge that
//! overlaps with its predecessor. On a current-thread runtime the claim
//! writes interleave deterministically at the verification sleep.

use std::time::Duration;

use teambridge::task::TaskStatus;

use crate::fixtures::{pending_task, TestWorkspace};

/// Test: Two claimants racing for one task
/// Given a single pending task
/// When two claimants scan at the same time
/// Then exactly one of them verifies its claim
#[tokio::test]
async fn test_single_task_has_one_verified_winner() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    ws.write_task("1", pending_task("1", "w1", &[]));

    let a = team.tasks.clone().with_claim_delay(Duration::from_millis(30));
    let b = team.tasks.clone().with_claim_delay(Duration::from_millis(30));
    let (ra, rb) = tokio::join!(a.find_next_task("w1"), b.find_next_task("w1"));
    let winners: Vec<_> = [ra.unwrap(), rb.unwrap()].into_iter().flatten().collect();

    assert_eq!(winners.len(), 1, "expected one winner, got {winners:?}");
    let on_disk = team.tasks.read_task("1").unwrap().unwrap();
    assert_eq!(on_disk.claim_token, winners[0].claim_token);
}

/// Test: A lost claim moves the scan forward
/// Given two pending tasks
/// When two claimants race
/// Then each ends up with a different task
#[tokio::test]
async fn test_loser_moves_on_to_next_task() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    ws.write_task("1", pending_task("1", "w1", &[]));
    ws.write_task("2", pending_task("2", "w1", &[]));

    let a = team.tasks.clone().with_claim_delay(Duration::from_millis(30));
    let b = team.tasks.clone().with_claim_delay(Duration::from_millis(30));
    let (ra, rb) = tokio::join!(a.find_next_task("w1"), b.find_next_task("w1"));
    let mut ids: Vec<String> = [ra.unwrap(), rb.unwrap()]
        .into_iter()
        .flatten()
        .map(|t| t.id)
        .collect();
    ids.sort();

    assert_eq!(ids, vec!["1", "2"]);
}

/// Test: A task that leaves pending during verification is not claimed
#[tokio::test]
async fn test_claim_lost_to_status_change() {
    let ws = TestWorkspace::new();
    let team = ws.team();
    ws.write_task("1", pending_task("1", "w1", &[]));

    let claimant = team.tasks.clone().with_claim_delay(Duration::from_millis(50));
    let lead = team.tasks.clone();
    let (claimed, ()) = tokio::join!(claimant.find_next_task("w1"), async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        lead.update_task(
            "1",
            &teambridge::task::TaskUpdate::status(TaskStatus::Completed),
        )
        .unwrap();
    });

    assert!(claimed.unwrap().is_none());
}
