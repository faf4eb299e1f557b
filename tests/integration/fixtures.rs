//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A temporary workspace with its own task root
//! - Writing raw task files
//! - A scripted executor standing in for the agent CLIs

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use teambridge::config::{BridgeConfig, Layout, Provider};
use teambridge::executor::{ExecOutcome, ExecRequest, Executor};
use teambridge::registry::{ProbeOutcome, ProbeResult};
use teambridge::restart::RestartPolicy;
use teambridge::session::SessionHost;
use teambridge::{Result, Team};

pub const TEAM: &str = "alpha";

/// A temporary working directory with the task root nested inside it.
pub struct TestWorkspace {
    pub temp_dir: TempDir,
    pub layout: Layout,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let layout = Layout::new(temp_dir.path().join("tasks"), temp_dir.path())
            .with_config_dir(temp_dir.path().join("home").join(".teambridge").join("config"));
        Self { temp_dir, layout }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Stand-in home directory that owns the synthesized bridge configs.
    pub fn home(&self) -> PathBuf {
        self.temp_dir.path().join("home")
    }

    /// The team with a short claim delay.
    pub fn team(&self) -> Team {
        self.team_with_policy(RestartPolicy::default())
    }

    pub fn team_with_policy(&self, policy: RestartPolicy) -> Team {
        Team::open(&self.layout, TEAM, policy)
            .expect("Failed to open team")
            .with_claim_delay(Duration::from_millis(10))
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.layout
            .team_tasks_dir(TEAM)
            .expect("Failed to resolve task dir")
    }

    /// Write a task file verbatim. `id` decides the file name.
    pub fn write_task(&self, id: &str, value: Value) {
        let dir = self.tasks_dir();
        std::fs::create_dir_all(&dir).expect("Failed to create task dir");
        std::fs::write(
            dir.join(format!("{id}.json")),
            serde_json::to_string_pretty(&value).expect("Failed to encode task"),
        )
        .expect("Failed to write task");
    }

    /// A bridge config tuned for fast tests.
    pub fn bridge_config(&self, worker: &str) -> BridgeConfig {
        let mut config = BridgeConfig::new(TEAM, worker, Provider::Codex, self.path());
        config.tasks_root = Some(self.layout.tasks_root().to_path_buf());
        config.poll_interval_ms = 20;
        config.heartbeat_interval_ms = 20;
        config.claim_delay_ms = 5;
        config.task_timeout_ms = 2_000;
        config
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending task owned by `owner`.
pub fn pending_task(id: &str, owner: &str, blocked_by: &[&str]) -> Value {
    serde_json::json!({
        "id": id,
        "subject": format!("Task {id}"),
        "description": format!("Do the work for task {id}"),
        "owner": owner,
        "status": "pending",
        "blockedBy": blocked_by,
    })
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// One scripted response of [`ScriptedExecutor`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Succeed(String),
    Fail(String),
    /// Never answers; the bridge timeout has to fire.
    Hang,
    /// Succeeds after a long run.
    Slow(Duration, String),
}

/// Executor double that replays scripted outcomes and records prompts.
/// Once the script runs out every call succeeds with "done".
pub struct ScriptedExecutor {
    probe: ProbeOutcome,
    script: Mutex<VecDeque<Scripted>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            probe: ProbeOutcome::Pass,
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_probe() -> Self {
        Self {
            probe: ProbeOutcome::Fail,
            ..Self::new(Vec::new())
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn probe(&self) -> Result<ProbeResult> {
        Ok(ProbeResult::new(self.probe, Some("test 1.0".to_string())))
    }

    async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome> {
        self.prompts.lock().unwrap().push(request.prompt);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Succeed(output)) => Ok(ExecOutcome::Success { output }),
            Some(Scripted::Fail(message)) => Ok(ExecOutcome::Failure { message }),
            Some(Scripted::Hang) => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(ExecOutcome::Success {
                    output: "late".to_string(),
                })
            }
            Some(Scripted::Slow(delay, output)) => {
                tokio::time::sleep(delay).await;
                Ok(ExecOutcome::Success { output })
            }
            None => Ok(ExecOutcome::Success {
                output: "done".to_string(),
            }),
        }
    }
}

/// Session host that only remembers which sessions it was asked to run.
#[derive(Default)]
pub struct FakeSessionHost {
    alive: Mutex<HashSet<String>>,
    pub spawned: Mutex<Vec<(String, Vec<String>)>>,
    pub killed: Mutex<Vec<String>>,
}

impl FakeSessionHost {
    pub fn mark_alive(&self, name: &str) {
        self.alive.lock().unwrap().insert(name.to_string());
    }

    /// Simulate the session's process exiting.
    pub fn crash(&self, name: &str) {
        self.alive.lock().unwrap().remove(name);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

impl SessionHost for FakeSessionHost {
    fn create_session(&self, name: &str, _cwd: &Path, cmd: &[String]) -> Result<()> {
        self.alive.lock().unwrap().insert(name.to_string());
        self.spawned
            .lock()
            .unwrap()
            .push((name.to_string(), cmd.to_vec()));
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        self.alive.lock().unwrap().remove(name);
        self.killed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn is_session_alive(&self, name: &str) -> bool {
        self.alive.lock().unwrap().contains(name)
    }

    fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.alive.lock().unwrap().iter().cloned().collect())
    }
}
