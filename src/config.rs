use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs_util::{sanitize_name, validate_resolved_path};
use crate::restart::RestartPolicy;
use crate::{tlog_debug, Error, Result};

/// Name of the per-workdir state directory.
pub const STATE_DIR_NAME: &str = ".teambridge";

/// Default heartbeat staleness bound used by monitors.
pub const DEFAULT_HEARTBEAT_MAX_AGE_MS: u64 = 30_000;

/// Global settings, read from `~/.teambridge/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Overrides `~/.teambridge/tasks` as the root of all team task directories.
    pub tasks_root: Option<String>,
    #[serde(default = "default_heartbeat_max_age_ms")]
    pub heartbeat_max_age_ms: u64,
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tasks_root: None,
            heartbeat_max_age_ms: DEFAULT_HEARTBEAT_MAX_AGE_MS,
            restart: RestartPolicy::default(),
        }
    }
}

fn default_heartbeat_max_age_ms() -> u64 {
    DEFAULT_HEARTBEAT_MAX_AGE_MS
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(STATE_DIR_NAME))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("config.toml"))
    }

    pub fn tasks_root(&self) -> Result<PathBuf> {
        match &self.tasks_root {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::home_dir()?.join("tasks")),
        }
    }

    pub fn heartbeat_max_age(&self) -> Duration {
        Duration::from_millis(self.heartbeat_max_age_ms)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            tlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        tlog_debug!(
            "Config loaded: tasks_root={:?}, heartbeat_max_age_ms={}",
            config.tasks_root,
            config.heartbeat_max_age_ms
        );
        Ok(config)
    }
}

/// Agent CLI a worker drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    /// Agent type recorded in the worker registry.
    pub fn agent_type(&self) -> String {
        format!("mcp-{}", self.as_str())
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_start_matches("mcp-") {
            "claude" => Ok(Provider::Claude),
            "codex" => Ok(Provider::Codex),
            "gemini" => Ok(Provider::Gemini),
            other => Err(Error::Validation(format!(
                "Invalid provider: {other}. Must be 'claude', 'codex' or 'gemini'."
            ))),
        }
    }
}

/// Everything one bridge process needs, normally read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub team_name: String,
    pub worker_name: String,
    pub provider: Provider,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_root: Option<PathBuf>,
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "defaults::max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "defaults::outbox_max_lines")]
    pub outbox_max_lines: usize,
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "defaults::claim_delay_ms")]
    pub claim_delay_ms: u64,
    #[serde(default = "defaults::audit_max_bytes")]
    pub audit_max_bytes: u64,
}

pub mod defaults {
    pub fn poll_interval_ms() -> u64 {
        3_000
    }
    pub fn task_timeout_ms() -> u64 {
        600_000
    }
    pub fn max_consecutive_errors() -> u32 {
        3
    }
    pub fn outbox_max_lines() -> usize {
        500
    }
    pub fn max_retries() -> u32 {
        5
    }
    pub fn heartbeat_interval_ms() -> u64 {
        5_000
    }
    pub fn claim_delay_ms() -> u64 {
        50
    }
    pub fn audit_max_bytes() -> u64 {
        5 * 1024 * 1024
    }
}

impl BridgeConfig {
    /// A config with every tunable at its default.
    pub fn new(
        team_name: impl Into<String>,
        worker_name: impl Into<String>,
        provider: Provider,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            team_name: team_name.into(),
            worker_name: worker_name.into(),
            provider,
            working_directory: working_directory.into(),
            model: None,
            tasks_root: None,
            poll_interval_ms: defaults::poll_interval_ms(),
            task_timeout_ms: defaults::task_timeout_ms(),
            max_consecutive_errors: defaults::max_consecutive_errors(),
            outbox_max_lines: defaults::outbox_max_lines(),
            max_retries: defaults::max_retries(),
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
            claim_delay_ms: defaults::claim_delay_ms(),
            audit_max_bytes: defaults::audit_max_bytes(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check identities against the allow-list. Never relaxed.
    pub fn validate(&self) -> Result<()> {
        sanitize_name("team name", &self.team_name)?;
        sanitize_name("worker name", &self.worker_name)?;
        if self.working_directory.as_os_str().is_empty() {
            return Err(Error::Validation(
                "Missing required config field: workingDirectory".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn claim_delay(&self) -> Duration {
        Duration::from_millis(self.claim_delay_ms)
    }

    /// Path layout for this worker.
    pub fn layout(&self) -> Result<Layout> {
        let tasks_root = match &self.tasks_root {
            Some(root) => root.clone(),
            None => Config::default().tasks_root()?,
        };
        Ok(Layout::new(tasks_root, &self.working_directory))
    }
}

/// Resolves every on-disk location from a task root and a working directory.
///
/// ```text
/// <tasks_root>/<team>/<id>.json                  task
/// <tasks_root>/<team>/<id>.failure.json          failure sidecar
/// <work_dir>/.teambridge/logs/team-bridge-<team>.jsonl   audit log
/// <work_dir>/.teambridge/state/<team>/...        heartbeats, mailboxes, signals
/// <config_dir>/<team>-<worker>.json              synthesized bridge config
/// ```
///
/// `config_dir` defaults to `<work_dir>/.teambridge/config`. Layouts built by
/// [`Layout::from_config`] put it under `~/.teambridge/config` instead, the
/// only place `teambridge run` accepts configs from for a workdir outside
/// the home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    tasks_root: PathBuf,
    work_dir: PathBuf,
    config_dir: PathBuf,
}

impl Layout {
    pub fn new(tasks_root: impl Into<PathBuf>, work_dir: impl AsRef<Path>) -> Self {
        let work_dir = work_dir.as_ref().to_path_buf();
        Self {
            tasks_root: tasks_root.into(),
            config_dir: work_dir.join(STATE_DIR_NAME).join("config"),
            work_dir,
        }
    }

    pub fn from_config(config: &Config, work_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(config.tasks_root()?, work_dir)
            .with_config_dir(Config::home_dir()?.join("config")))
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn tasks_root(&self) -> &Path {
        &self.tasks_root
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state_root(&self) -> PathBuf {
        self.work_dir.join(STATE_DIR_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_root().join("logs")
    }

    pub fn team_tasks_dir(&self, team: &str) -> Result<PathBuf> {
        let dir = self.tasks_root.join(sanitize_name("team name", team)?);
        validate_resolved_path(&dir, &self.tasks_root)?;
        Ok(dir)
    }

    pub fn team_state_dir(&self, team: &str) -> Result<PathBuf> {
        let base = self.state_root().join("state");
        let dir = base.join(sanitize_name("team name", team)?);
        validate_resolved_path(&dir, &base)?;
        Ok(dir)
    }

    pub fn audit_log_path(&self, team: &str) -> Result<PathBuf> {
        let path = self
            .logs_dir()
            .join(format!("team-bridge-{}.jsonl", sanitize_name("team name", team)?));
        validate_resolved_path(&path, &self.work_dir)?;
        Ok(path)
    }

    pub fn bridge_log_path(&self, team: &str, worker: &str) -> Result<PathBuf> {
        Ok(self.logs_dir().join(format!(
            "bridge-{}-{}.log",
            sanitize_name("team name", team)?,
            sanitize_name("worker name", worker)?
        )))
    }

    /// Where synthesized configs for respawned workers are written.
    pub fn bridge_config_path(&self, team: &str, worker: &str) -> Result<PathBuf> {
        Ok(self.config_dir.join(format!(
            "{}-{}.json",
            sanitize_name("team name", team)?,
            sanitize_name("worker name", worker)?
        )))
    }
}

/// A bridge config must come from the user's home, inside a trusted subpath.
pub fn validate_config_path(config_path: &Path, home_dir: &Path) -> bool {
    let path = config_path.to_string_lossy();
    let home = home_dir.to_string_lossy();
    let under_home = path.starts_with(&format!("{}/", home.trim_end_matches('/')));
    let trusted = path.contains(&format!("/{STATE_DIR_NAME}/")) || path.contains("/.claude/");
    under_home && trusted
}

/// The bridge working directory must exist, be a directory and sit inside a
/// git worktree. Returns the canonical path.
pub fn validate_working_directory(dir: &Path) -> Result<PathBuf> {
    let meta = fs::metadata(dir).map_err(|_| {
        Error::Validation(format!(
            "workingDirectory does not exist: {}",
            dir.display()
        ))
    })?;
    if !meta.is_dir() {
        return Err(Error::Validation(format!(
            "workingDirectory is not a directory: {}",
            dir.display()
        )));
    }
    let resolved = dir.canonicalize()?;
    git2::Repository::discover(&resolved).map_err(|_| {
        Error::Validation(format!(
            "workingDirectory is not inside a git worktree: {}",
            dir.display()
        ))
    })?;
    Ok(resolved)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
