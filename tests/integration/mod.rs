//! Integration tests for teambridge.
//!
//! Every test runs against a throwaway directory holding both the task root
//! and the `.teambridge` state tree. Agent CLIs are replaced by a scripted
//! executor, so nothing here needs claude, codex, gemini or tmux installed.
//!
//! # Test Categories
//!
//! - `task_scheduling`: claiming, ordering and blocker resolution
//! - `claim_race`: concurrent claimants on the same task directory
//! - `bridge_loop`: the worker loop end to end
//! - `team_status`: monitor snapshots and health reports
//! - `restart_supervision`: crash restarts, backoff and abandonment

mod fixtures;

mod claim_race;
mod restart_supervision;
mod task_scheduling;
mod team_status;
