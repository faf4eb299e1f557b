//! External agent execution.
//!
//! The bridge treats the agent as an opaque capability: a prompt and a
//! working directory go in, success or failure text comes out, within a
//! deadline. [`CliExecutor`] drives a provider CLI in headless mode; tests
//! substitute their own [`Executor`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::Provider;
use crate::mailbox::InboxMessage;
use crate::registry::{ProbeOutcome, ProbeResult};
use crate::task::TaskFile;
use crate::{tlog_debug, tlog_warn, Error, Result};

/// Longest task description carried into a prompt.
pub const MAX_PROMPT_FIELD_CHARS: usize = 10_000;

/// Longest summary reported back through the outbox.
pub const MAX_SUMMARY_CHARS: usize = 500;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub prompt: String,
    pub working_directory: PathBuf,
    pub timeout: Duration,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Success { output: String },
    Failure { message: String },
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success { .. })
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// One-time capability check, cached by the caller.
    async fn probe(&self) -> Result<ProbeResult>;

    /// Run one task. `Err` is reserved for the executor itself breaking
    /// (spawn failure, timeout); an agent that ran and failed is
    /// `Ok(ExecOutcome::Failure)`.
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome>;
}

/// Claude's `--output-format json` envelope.
#[derive(Debug, Deserialize)]
struct ClaudeEnvelope {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CliExecutor {
    provider: Provider,
    binary: PathBuf,
}

impl CliExecutor {
    /// Locate the provider's CLI on `PATH`.
    pub fn new(provider: Provider) -> Result<Self> {
        let binary = which::which(provider.as_str())
            .map_err(|_| Error::AgentNotAvailable(provider.as_str().to_string()))?;
        Ok(Self { provider, binary })
    }

    pub fn with_binary(provider: Provider, binary: PathBuf) -> Self {
        Self { provider, binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args(&self, request: &ExecRequest) -> Vec<String> {
        let mut args = match self.provider {
            Provider::Claude => vec![
                "-p".to_string(),
                request.prompt.clone(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            Provider::Codex => vec!["exec".to_string(), request.prompt.clone()],
            Provider::Gemini => vec!["-p".to_string(), request.prompt.clone()],
        };
        if let Some(model) = &request.model {
            args.push(match self.provider {
                Provider::Claude => "--model".to_string(),
                Provider::Codex | Provider::Gemini => "-m".to_string(),
            });
            args.push(model.clone());
        }
        args
    }

    fn interpret(&self, success: bool, code: Option<i32>, stdout: &str, stderr: &str) -> ExecOutcome {
        if self.provider == Provider::Claude {
            if let Ok(envelope) = serde_json::from_str::<ClaudeEnvelope>(stdout.trim()) {
                let failed = envelope.is_error || envelope.subtype.as_deref() == Some("error");
                return if failed {
                    ExecOutcome::Failure {
                        message: envelope.error.or(envelope.result).unwrap_or_default(),
                    }
                } else {
                    ExecOutcome::Success {
                        output: envelope.result.unwrap_or_default(),
                    }
                };
            }
        }

        if success {
            ExecOutcome::Success {
                output: stdout.trim().to_string(),
            }
        } else if stderr.trim().is_empty() {
            ExecOutcome::Failure {
                message: format!(
                    "{} exited with code {}",
                    self.provider,
                    code.unwrap_or(-1)
                ),
            }
        } else {
            ExecOutcome::Failure {
                message: stderr.trim().to_string(),
            }
        }
    }
}

#[async_trait]
impl Executor for CliExecutor {
    async fn probe(&self) -> Result<ProbeResult> {
        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new(&self.binary)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(PROBE_TIMEOUT))??;

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let outcome = match (output.status.success(), version.is_empty()) {
            (true, false) => ProbeOutcome::Pass,
            (true, true) => ProbeOutcome::Partial,
            (false, _) => ProbeOutcome::Fail,
        };
        tlog_debug!("Probed {}: {:?} {}", self.provider, outcome, version);
        Ok(ProbeResult::new(
            outcome,
            (!version.is_empty()).then_some(version),
        ))
    }

    async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome> {
        tlog_debug!(
            "Executing {} in {} (timeout {:?})",
            self.provider,
            request.working_directory.display(),
            request.timeout
        );
        let output = tokio::time::timeout(
            request.timeout,
            Command::new(&self.binary)
                .args(self.args(&request))
                .current_dir(&request.working_directory)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(request.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let outcome = self.interpret(output.status.success(), output.status.code(), &stdout, &stderr);
        if !outcome.is_success() {
            tlog_warn!("{} run failed: {:?}", self.provider, outcome);
        }
        Ok(outcome)
    }
}

fn delimiter_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)</?\s*(task|subject|description|context|message)\b[^>]*>")
            .expect("static regex")
    })
}

/// Make untrusted text safe to embed in a prompt: drop control characters,
/// strip the prompt's own delimiter tags and cap the length.
pub fn sanitize_prompt_content(content: &str, max_chars: usize) -> String {
    let cleaned: String = content
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let stripped = delimiter_pattern().replace_all(&cleaned, "");
    truncate_chars(&stripped, max_chars)
}

pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Render the prompt handed to the agent for one task.
pub fn build_task_prompt(task: &TaskFile, context: &[InboxMessage]) -> String {
    let subject = task.subject.as_deref().unwrap_or("(no subject)");
    let description = task.description.as_deref().unwrap_or("");

    let mut prompt = format!(
        "<task id=\"{}\">\n<subject>{}</subject>\n<description>\n{}\n</description>\n</task>\n",
        task.id,
        sanitize_prompt_content(subject, 500),
        sanitize_prompt_content(description, MAX_PROMPT_FIELD_CHARS),
    );

    if !context.is_empty() {
        prompt.push_str("\n<context>\n");
        for message in context {
            prompt.push_str("<message>");
            prompt.push_str(&sanitize_prompt_content(&message.content, 2_000));
            prompt.push_str("</message>\n");
        }
        prompt.push_str("</context>\n");
    }

    prompt.push_str(
        "\nComplete the task above in the current working directory. \
         Finish with a short summary of what you changed.\n",
    );
    prompt
}
