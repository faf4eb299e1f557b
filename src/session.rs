//! Persistent per-worker sessions.
//!
//! A bridge runs inside a session host so it survives the terminal that
//! launched it and can be reattached after a restart. Session names are
//! `tb_<team>_<worker>`, built only from allow-listed names.

use std::path::Path;
use std::process::{Command, Output};

use crate::config::{BridgeConfig, Layout};
use crate::fs_util::{atomic_write_json, sanitize_name};
use crate::{tlog_debug, tlog_trace, tlog_warn, Error, Result};

pub const SESSION_PREFIX: &str = "tb_";

pub trait SessionHost: Send + Sync {
    fn create_session(&self, name: &str, cwd: &Path, cmd: &[String]) -> Result<()>;
    fn kill_session(&self, name: &str) -> Result<()>;
    fn is_session_alive(&self, name: &str) -> bool;
    fn list_sessions(&self) -> Result<Vec<String>>;
}

/// Session name for a worker. Fails on names outside the allow-list.
pub fn session_name(team: &str, worker: &str) -> Result<String> {
    Ok(format!(
        "{}{}_{}",
        SESSION_PREFIX,
        sanitize_name("team name", team)?,
        sanitize_name("worker name", worker)?
    ))
}

/// Active sessions that belong to `team`.
pub fn list_team_sessions(host: &dyn SessionHost, team: &str) -> Result<Vec<String>> {
    let prefix = format!("{}{}_", SESSION_PREFIX, sanitize_name("team name", team)?);
    Ok(host
        .list_sessions()?
        .into_iter()
        .filter(|s| s.starts_with(&prefix))
        .collect())
}

/// Write `config` to its per-worker path and start `teambridge run` in a
/// fresh session. Returns the session name.
pub fn spawn_bridge_in_session(
    host: &dyn SessionHost,
    layout: &Layout,
    config: &BridgeConfig,
) -> Result<String> {
    config.validate()?;
    let name = session_name(&config.team_name, &config.worker_name)?;
    let config_path = layout.bridge_config_path(&config.team_name, &config.worker_name)?;
    atomic_write_json(&config_path, config)?;

    let exe = std::env::current_exe()?;
    let cmd = vec![
        exe.display().to_string(),
        "run".to_string(),
        "--config".to_string(),
        config_path.display().to_string(),
    ];
    host.create_session(&name, &config.working_directory, &cmd)?;
    tlog_debug!("Spawned bridge {} with config {}", name, config_path.display());
    Ok(name)
}

/// tmux as the session host.
#[derive(Debug, Clone, Copy, Default)]
pub struct TmuxHost;

impl TmuxHost {
    pub fn is_available() -> bool {
        tmux(&["-V"]).is_ok_and(|o| o.status.success())
    }

    pub fn validate() -> Result<()> {
        if Self::is_available() {
            Ok(())
        } else {
            Err(Error::Tmux("tmux is not installed or not on PATH".to_string()))
        }
    }
}

fn tmux(args: &[&str]) -> std::io::Result<Output> {
    tlog_trace!("tmux {}", args.join(" "));
    Command::new("tmux").args(args).output()
}

impl SessionHost for TmuxHost {
    fn create_session(&self, name: &str, cwd: &Path, cmd: &[String]) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::Validation(format!("Empty command for session {name}")));
        }
        let line: Vec<String> = cmd.iter().map(|s| shell_escape(s)).collect();
        let cwd = cwd.display().to_string();
        let output = tmux(&["new-session", "-d", "-s", name, "-c", &cwd, &line.join(" ")])?;
        if output.status.success() {
            tlog_debug!("Created tmux session {} in {}", name, cwd);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        tlog_warn!("tmux new-session {} failed: {}", name, stderr.trim());
        Err(Error::Tmux(format!("new-session {name}: {}", stderr.trim())))
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        let output = tmux(&["kill-session", "-t", name])?;
        if output.status.success() {
            tlog_debug!("Killed tmux session {}", name);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Already gone counts as killed.
        if stderr.contains("session not found") || stderr.contains("can't find session") {
            return Ok(());
        }
        tlog_warn!("tmux kill-session {} failed: {}", name, stderr.trim());
        Err(Error::Tmux(format!("kill-session {name}: {}", stderr.trim())))
    }

    fn is_session_alive(&self, name: &str) -> bool {
        tmux(&["has-session", "-t", name]).is_ok_and(|o| o.status.success())
    }

    fn list_sessions(&self) -> Result<Vec<String>> {
        let output = tmux(&["list-sessions", "-F", "#{session_name}"])?;
        if !output.status.success() {
            // No server running means no sessions.
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect())
    }
}

fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '='))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
