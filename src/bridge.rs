//! The per-worker bridge loop.
//!
//! ```text
//! Idle -> Polling -> Executing -> Reporting -> Idle
//! ```
//!
//! Shutdown and drain signals are checked at the top of every cycle and
//! always win over starting new work. Cancellation is only observed at cycle
//! boundaries; a running execution is never interrupted except by its own
//! timeout. Past `max_consecutive_errors` the loop quarantines the worker and
//! returns [`Error::TooManyErrors`]; relaunching is the supervisor's call.
//!
//! Heartbeats come from a separate ticker task fed through a `watch`
//! channel, so liveness stays accurate during long executions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditEventType};
use crate::config::BridgeConfig;
use crate::executor::{build_task_prompt, truncate_chars, ExecOutcome, ExecRequest, Executor, MAX_SUMMARY_CHARS};
use crate::heartbeat::{HeartbeatData, HeartbeatRegistry, WorkerState};
use crate::mailbox::{InboxMessage, OutboxMessage, OutboxMessageType, Signal, SignalKind};
use crate::registry::{McpWorkerMember, ProbeOutcome, ProbeResult};
use crate::restart::RestartPolicy;
use crate::task::{TaskFile, TaskStatus, TaskUpdate};
use crate::team::Team;
use crate::util::blocking;
use crate::{tlog, tlog_debug, tlog_error, tlog_warn, Error, Result};

/// Inbox messages held for the next prompt.
pub const MAX_PENDING_CONTEXT: usize = 20;

/// How a bridge left its loop without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeExit {
    Shutdown { request_id: String },
    Drained { request_id: String },
    /// The process was asked to stop (SIGINT/SIGTERM).
    Cancelled,
}

/// State of one bridge run, passed explicitly into every step.
#[derive(Debug, Clone)]
pub struct BridgeSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub consecutive_errors: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub pending_context: Vec<InboxMessage>,
    idle_announced: bool,
    all_complete_announced: bool,
}

impl BridgeSession {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            consecutive_errors: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            pending_context: Vec::new(),
            idle_announced: false,
            all_complete_announced: false,
        }
    }

    fn push_context(&mut self, messages: Vec<InboxMessage>) {
        self.pending_context.extend(messages);
        if self.pending_context.len() > MAX_PENDING_CONTEXT {
            let excess = self.pending_context.len() - MAX_PENDING_CONTEXT;
            self.pending_context.drain(..excess);
        }
    }

    fn mark_busy(&mut self) {
        self.idle_announced = false;
        self.all_complete_announced = false;
    }
}

impl Default for BridgeSession {
    fn default() -> Self {
        Self::new()
    }
}

enum Cycle {
    Worked,
    Idle,
    Exit(BridgeExit),
}

enum Failure {
    Agent(String),
    Timeout(Duration),
}

pub struct Bridge {
    config: BridgeConfig,
    team: Team,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
}

impl Bridge {
    /// # Errors
    /// Fails on team/worker names outside the allow-list or unresolvable paths.
    pub fn new(config: BridgeConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let layout = config.layout()?;
        let team = Team::open(&layout, &config.team_name, RestartPolicy::default())?
            .with_claim_delay(config.claim_delay());
        Ok(Self {
            config,
            team,
            executor,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn worker(&self) -> &str {
        &self.config.worker_name
    }

    fn audit(&self, event_type: AuditEventType) -> AuditEvent {
        AuditEvent::new(event_type, self.team.name()).worker(self.worker())
    }

    fn outbox(&self, message: OutboxMessage) {
        if let Err(e) = self.team.mailbox.append_outbox(self.worker(), &message) {
            tlog_warn!("Failed to append outbox {:?}: {}", message.message_type, e);
        }
    }

    /// Run until shutdown, drain or cancellation.
    ///
    /// # Errors
    /// `TooManyErrors` when the worker quarantines itself; startup failures
    /// (probe, registration) are returned as-is.
    pub async fn run(&self) -> Result<BridgeExit> {
        let mut session = BridgeSession::new();
        tlog!(
            "Bridge {}/{} starting (session {}, provider {})",
            self.team.name(),
            self.worker(),
            session.session_id,
            self.config.provider
        );

        let probe = self.ensure_probed().await?;
        let mut member = McpWorkerMember::new(self.worker(), self.config.provider);
        member.cwd = Some(self.config.working_directory.clone());
        member.model = self.config.model.clone();
        self.team.registry.register(&member)?;

        let mut initial = HeartbeatData::new(self.team.name(), self.worker());
        initial.pid = Some(std::process::id());
        initial.provider = Some(self.config.provider.to_string());
        initial.state = WorkerState::Idle;
        self.team.heartbeats.write(&initial)?;
        let (beat_tx, beat_rx) = watch::channel(initial);

        let ticker_stop = self.cancel.child_token();
        let ticker = spawn_heartbeat_ticker(
            self.team.heartbeats.clone(),
            beat_rx,
            self.config.heartbeat_interval(),
            ticker_stop.clone(),
        );

        self.outbox(OutboxMessage::new(OutboxMessageType::Ready).message(format!(
            "{} ready ({})",
            self.worker(),
            self.config.provider
        )));
        self.team.audit.record(self.audit(AuditEventType::BridgeStart).details(json!({
            "sessionId": session.session_id,
            "provider": self.config.provider.as_str(),
            "pid": std::process::id(),
            "probe": probe.probe_result,
        })));

        let outcome = self.run_loop(&mut session, &beat_tx).await;

        ticker_stop.cancel();
        if let Err(e) = ticker.await {
            tlog_warn!("Heartbeat ticker ended abnormally: {}", e);
        }

        match &outcome {
            Ok(exit) => {
                self.team.audit.record(self.audit(AuditEventType::BridgeShutdown).details(json!({
                    "sessionId": session.session_id,
                    "reason": exit_reason(exit),
                    "tasksCompleted": session.tasks_completed,
                    "tasksFailed": session.tasks_failed,
                })));
                self.depart();
            }
            Err(e) => tlog_error!("Bridge {}/{} stopped: {}", self.team.name(), self.worker(), e),
        }
        outcome
    }

    async fn run_loop(
        &self,
        session: &mut BridgeSession,
        beat: &watch::Sender<HeartbeatData>,
    ) -> Result<BridgeExit> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(BridgeExit::Cancelled);
            }

            let idle = match self.cycle(session, beat).await {
                Ok(Cycle::Exit(exit)) => return Ok(exit),
                Ok(Cycle::Worked) => false,
                Ok(Cycle::Idle) => true,
                Err(e) => {
                    session.consecutive_errors += 1;
                    tlog_error!("Bridge cycle failed ({}): {}", session.consecutive_errors, e);
                    self.outbox(OutboxMessage::new(OutboxMessageType::Error).error(e.to_string()));
                    true
                }
            };

            if session.consecutive_errors >= self.config.max_consecutive_errors {
                return Err(self.quarantine(session, beat));
            }

            if idle {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }
    }

    async fn cycle(
        &self,
        session: &mut BridgeSession,
        beat: &watch::Sender<HeartbeatData>,
    ) -> Result<Cycle> {
        self.rotate();

        if let Some(signal) = self.team.mailbox.check_shutdown_signal(self.worker())? {
            return Ok(Cycle::Exit(self.acknowledge_shutdown(signal, beat)?));
        }
        if let Some(signal) = self.team.mailbox.check_drain_signal(self.worker())? {
            return Ok(Cycle::Exit(self.acknowledge_drain(signal, beat)?));
        }

        let inbox = self.team.mailbox.read_new_inbox_messages(self.worker())?;
        if !inbox.is_empty() {
            tlog_debug!("Received {} inbox message(s)", inbox.len());
            session.push_context(inbox);
        }

        self.set_state(beat, session, WorkerState::Polling, None);
        match self.team.tasks.find_next_task(self.worker()).await? {
            Some(task) => {
                self.process_task(session, beat, task).await?;
                Ok(Cycle::Worked)
            }
            None => {
                self.announce_idle(session)?;
                self.set_state(beat, session, WorkerState::Idle, None);
                Ok(Cycle::Idle)
            }
        }
    }

    async fn process_task(
        &self,
        session: &mut BridgeSession,
        beat: &watch::Sender<HeartbeatData>,
        task: TaskFile,
    ) -> Result<()> {
        let id = task.id.clone();
        session.mark_busy();
        self.team
            .audit
            .record(self.audit(AuditEventType::TaskClaimed).task(&id));
        self.team
            .tasks
            .update_task(&id, &TaskUpdate::status(TaskStatus::InProgress))?;
        self.set_state(beat, session, WorkerState::Executing, Some(&id));
        self.team
            .audit
            .record(self.audit(AuditEventType::TaskStarted).task(&id));
        tlog!("Executing task {} ({:?})", id, task.subject);

        let context = std::mem::take(&mut session.pending_context);
        let request = ExecRequest {
            prompt: build_task_prompt(&task, &context),
            working_directory: self.config.working_directory.clone(),
            timeout: self.config.task_timeout(),
            model: self.config.model.clone(),
        };

        let started = Instant::now();
        let timeout = self.config.task_timeout();
        let result = tokio::time::timeout(timeout, self.executor.execute(request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.set_state(beat, session, WorkerState::Reporting, Some(&id));

        let failure = match result {
            Ok(Ok(ExecOutcome::Success { output })) => {
                self.complete_task(session, &id, &output, elapsed_ms)?;
                None
            }
            Ok(Ok(ExecOutcome::Failure { message })) => Some(Failure::Agent(message)),
            Ok(Err(Error::Timeout(limit))) => Some(Failure::Timeout(limit)),
            Ok(Err(e)) => Some(Failure::Agent(e.to_string())),
            Err(_) => Some(Failure::Timeout(timeout)),
        };
        if let Some(failure) = failure {
            self.fail_task(session, &id, failure)?;
        }

        self.set_state(beat, session, WorkerState::Idle, None);
        Ok(())
    }

    fn complete_task(
        &self,
        session: &mut BridgeSession,
        id: &str,
        output: &str,
        elapsed_ms: u64,
    ) -> Result<()> {
        let update = TaskUpdate::status(TaskStatus::Completed)
            .with_field("completedAt", Value::String(Utc::now().to_rfc3339()));
        self.team.tasks.update_task(id, &update)?;

        session.consecutive_errors = 0;
        session.tasks_completed += 1;
        self.outbox(
            OutboxMessage::new(OutboxMessageType::TaskComplete)
                .task(id)
                .summary(truncate_chars(output.trim(), MAX_SUMMARY_CHARS)),
        );
        self.team.audit.record(
            self.audit(AuditEventType::TaskCompleted)
                .task(id)
                .details(json!({ "durationMs": elapsed_ms })),
        );
        tlog!("Task {} completed in {}ms", id, elapsed_ms);
        Ok(())
    }

    /// Record a failed attempt. The task goes back to pending while retries
    /// remain, and is marked permanently failed once they are exhausted.
    fn fail_task(&self, session: &mut BridgeSession, id: &str, failure: Failure) -> Result<()> {
        let (error, cli_event) = match failure {
            Failure::Agent(message) => (message, AuditEventType::CliError),
            Failure::Timeout(limit) => (
                format!("Task timed out after {}ms", limit.as_millis()),
                AuditEventType::CliTimeout,
            ),
        };
        tlog_warn!("Task {} failed: {}", id, error);
        session.consecutive_errors += 1;
        self.team.audit.record(
            self.audit(cli_event)
                .task(id)
                .details(json!({ "error": error })),
        );

        let sidecar = self.team.tasks.write_task_failure(id, &error)?;
        if self.team.tasks.is_task_retry_exhausted(id, self.config.max_retries)? {
            self.team.tasks.mark_permanently_failed(id, &error)?;
            session.tasks_failed += 1;
            self.team.audit.record(
                self.audit(AuditEventType::TaskPermanentlyFailed)
                    .task(id)
                    .details(json!({ "error": error, "retryCount": sidecar.retry_count })),
            );
            self.outbox(
                OutboxMessage::new(OutboxMessageType::TaskFailed)
                    .task(id)
                    .error(format!(
                        "{error} (permanently failed after {} attempts)",
                        sidecar.retry_count
                    )),
            );
        } else {
            self.team
                .tasks
                .update_task(id, &TaskUpdate::status(TaskStatus::Pending))?;
            self.team.audit.record(
                self.audit(AuditEventType::TaskFailed)
                    .task(id)
                    .details(json!({ "error": error, "retryCount": sidecar.retry_count })),
            );
            self.outbox(
                OutboxMessage::new(OutboxMessageType::TaskFailed)
                    .task(id)
                    .error(format!(
                        "{error} (attempt {}/{})",
                        sidecar.retry_count, self.config.max_retries
                    )),
            );
        }
        Ok(())
    }

    fn announce_idle(&self, session: &mut BridgeSession) -> Result<()> {
        if !session.idle_announced {
            session.idle_announced = true;
            self.outbox(OutboxMessage::new(OutboxMessageType::Idle).message("No eligible tasks"));
            self.team
                .audit
                .record(self.audit(AuditEventType::WorkerIdle));
        }

        if !session.all_complete_announced {
            let remaining = self
                .team
                .tasks
                .read_all_tasks()
                .iter()
                .filter(|t| t.owner == self.worker())
                .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
                .count();
            if remaining == 0 {
                session.all_complete_announced = true;
                self.outbox(
                    OutboxMessage::new(OutboxMessageType::AllTasksComplete).message(format!(
                        "{} completed, {} failed",
                        session.tasks_completed, session.tasks_failed
                    )),
                );
            }
        }
        Ok(())
    }

    fn acknowledge_shutdown(
        &self,
        signal: Signal,
        beat: &watch::Sender<HeartbeatData>,
    ) -> Result<BridgeExit> {
        tlog!("Shutdown requested: {}", signal.reason);
        beat.send_modify(|b| b.state = WorkerState::ShuttingDown);
        self.outbox(
            OutboxMessage::new(OutboxMessageType::ShutdownAck)
                .request(&signal.request_id)
                .message(signal.reason.clone()),
        );
        self.team.audit.record(
            self.audit(AuditEventType::ShutdownReceived)
                .details(json!({ "requestId": signal.request_id, "reason": signal.reason })),
        );
        self.team
            .mailbox
            .delete_signal(SignalKind::Shutdown, self.worker())?;
        Ok(BridgeExit::Shutdown {
            request_id: signal.request_id,
        })
    }

    fn acknowledge_drain(
        &self,
        signal: Signal,
        beat: &watch::Sender<HeartbeatData>,
    ) -> Result<BridgeExit> {
        tlog!("Drain requested: {}", signal.reason);
        beat.send_modify(|b| b.state = WorkerState::Draining);
        self.outbox(
            OutboxMessage::new(OutboxMessageType::DrainAck)
                .request(&signal.request_id)
                .message(signal.reason.clone()),
        );
        self.team.audit.record(
            self.audit(AuditEventType::DrainReceived)
                .details(json!({ "requestId": signal.request_id, "reason": signal.reason })),
        );
        self.team
            .mailbox
            .delete_signal(SignalKind::Drain, self.worker())?;
        Ok(BridgeExit::Drained {
            request_id: signal.request_id,
        })
    }

    /// Leave the heartbeat behind marked quarantined and keep the
    /// registration, so the supervisor can see and relaunch the worker.
    fn quarantine(&self, session: &BridgeSession, beat: &watch::Sender<HeartbeatData>) -> Error {
        let count = session.consecutive_errors;
        let max = self.config.max_consecutive_errors;
        tlog_error!("Quarantining {} after {} consecutive errors", self.worker(), count);
        self.set_state(beat, session, WorkerState::Quarantined, None);
        self.outbox(
            OutboxMessage::new(OutboxMessageType::Error)
                .error(format!("Quarantined after {count} consecutive errors")),
        );
        self.team.audit.record(
            self.audit(AuditEventType::WorkerQuarantined)
                .details(json!({ "consecutiveErrors": count, "max": max })),
        );
        Error::TooManyErrors { count, max }
    }

    /// Graceful departure: liveness and registration go away immediately.
    fn depart(&self) {
        if let Err(e) = self.team.heartbeats.delete(self.worker()) {
            tlog_warn!("Failed to delete heartbeat: {}", e);
        }
        if let Err(e) = self.team.registry.unregister(self.worker()) {
            tlog_warn!("Failed to unregister: {}", e);
        }
    }

    async fn ensure_probed(&self) -> Result<ProbeResult> {
        let provider = self.config.provider;
        if let Some(cached) = self.team.registry.read_probe_result(provider) {
            if cached.probe_result != ProbeOutcome::Fail {
                tlog_debug!("Using cached probe for {}: {:?}", provider, cached.probe_result);
                return Ok(cached);
            }
        }
        let result = self.executor.probe().await?;
        self.team.registry.write_probe_result(provider, &result)?;
        if result.probe_result == ProbeOutcome::Fail {
            return Err(Error::AgentNotAvailable(provider.to_string()));
        }
        Ok(result)
    }

    fn rotate(&self) {
        let worker = self.worker();
        let max_lines = self.config.outbox_max_lines;
        match self.team.mailbox.rotate_outbox_if_needed(worker, max_lines) {
            Ok(true) => self
                .team
                .audit
                .record(self.audit(AuditEventType::OutboxRotated)),
            Ok(false) => {}
            Err(e) => tlog_warn!("Outbox rotation failed: {}", e),
        }
        match self.team.mailbox.rotate_inbox_if_needed(worker, max_lines) {
            Ok(true) => self
                .team
                .audit
                .record(self.audit(AuditEventType::InboxRotated)),
            Ok(false) => {}
            Err(e) => tlog_warn!("Inbox rotation failed: {}", e),
        }
        if let Err(e) = self.team.audit.rotate(self.config.audit_max_bytes) {
            tlog_warn!("Audit log rotation failed: {}", e);
        }
    }

    /// Update the shared heartbeat and write it through at once so state
    /// transitions do not wait for the next tick.
    fn set_state(
        &self,
        beat: &watch::Sender<HeartbeatData>,
        session: &BridgeSession,
        state: WorkerState,
        task_id: Option<&str>,
    ) {
        beat.send_modify(|b| {
            b.state = state;
            b.current_task_id = task_id.map(String::from);
            b.consecutive_errors = session.consecutive_errors;
        });
        let snapshot = beat.borrow().clone();
        if let Err(e) = self.team.heartbeats.write(&snapshot) {
            tlog_warn!("Failed to write heartbeat: {}", e);
        }
    }
}

fn exit_reason(exit: &BridgeExit) -> &'static str {
    match exit {
        BridgeExit::Shutdown { .. } => "shutdown",
        BridgeExit::Drained { .. } => "drain",
        BridgeExit::Cancelled => "cancelled",
    }
}

fn spawn_heartbeat_ticker(
    heartbeats: HeartbeatRegistry,
    beat: watch::Receiver<HeartbeatData>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let data = beat.borrow().clone();
                    let registry = heartbeats.clone();
                    if let Err(e) = blocking(move || registry.write(&data)).await {
                        tlog_warn!("Heartbeat tick failed: {}", e);
                    }
                }
            }
        }
    })
}
