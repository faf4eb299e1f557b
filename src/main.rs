use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use teambridge::audit::{AuditEventType, AuditFilter};
use teambridge::config::{validate_config_path, validate_working_directory};
use teambridge::executor::CliExecutor;
use teambridge::graph::analyze_blockers;
use teambridge::health::worker_health_reports;
use teambridge::mailbox::{InboxMessage, InboxMessageType};
use teambridge::session::{session_name, SessionHost, TmuxHost};
use teambridge::status::get_team_status;
use teambridge::supervisor::supervise_once;
use teambridge::{
    log, tlog, tlog_error, tlog_warn, Bridge, BridgeConfig, BridgeExit, Config, Error, Layout,
    Result, Team,
};

#[derive(Parser)]
#[command(name = "teambridge")]
#[command(version, about = "Run and supervise CLI agent workers over a shared task directory")]
#[command(after_help = "ENVIRONMENT:\n    TEAMBRIDGE_DEBUG=1    Enable debug logging")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct TeamArgs {
    /// Team name
    #[arg(short, long)]
    team: String,

    /// Working directory holding the team's .teambridge state (defaults to cwd)
    #[arg(short, long)]
    workdir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one bridge worker from a config file
    Run {
        /// Path to the bridge config JSON
        #[arg(short, long)]
        config: PathBuf,
    },
    #[command(flatten)]
    Lead(LeadCommand),
}

/// Commands a lead or monitor runs against a team.
#[derive(Subcommand)]
enum LeadCommand {
    /// Show a snapshot of a team
    Status {
        #[command(flatten)]
        team: TeamArgs,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// List the team's tasks and blocker problems
    Tasks {
        #[command(flatten)]
        team: TeamArgs,
        #[arg(long)]
        json: bool,
    },
    /// Query the team audit log
    Audit {
        #[command(flatten)]
        team: TeamArgs,
        /// Only events of this type (e.g. task_completed)
        #[arg(long)]
        event: Option<String>,
        /// Only events of this worker
        #[arg(long)]
        worker: Option<String>,
        /// Only events from the last N minutes
        #[arg(long)]
        since_minutes: Option<i64>,
        /// Show at most the last N events
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Report worker health
    Health {
        #[command(flatten)]
        team: TeamArgs,
        #[arg(long)]
        json: bool,
    },
    /// Read worker outbox messages
    Messages {
        #[command(flatten)]
        team: TeamArgs,
        /// Only this worker (defaults to every worker)
        worker: Option<String>,
        /// Show the whole outbox instead of consuming unread messages
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Send a message to a worker's inbox
    Send {
        #[command(flatten)]
        team: TeamArgs,
        worker: String,
        message: String,
        /// Send as context instead of a message
        #[arg(long)]
        context: bool,
    },
    /// Ask a worker to shut down at its next cycle
    Shutdown {
        #[command(flatten)]
        team: TeamArgs,
        worker: String,
        #[arg(long, default_value = "requested by lead")]
        reason: String,
    },
    /// Ask a worker to stop after its current task
    Drain {
        #[command(flatten)]
        team: TeamArgs,
        worker: String,
        #[arg(long, default_value = "requested by lead")]
        reason: String,
    },
    /// Kill a worker's session and remove its state
    Teardown {
        #[command(flatten)]
        team: TeamArgs,
        worker: String,
    },
    /// Restart crashed workers with backoff
    Supervise {
        #[command(flatten)]
        team: TeamArgs,
        /// Seconds between passes
        #[arg(long, default_value_t = 10)]
        interval: u64,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // A bridge logs to its own per-worker file once its config is known.
    if !matches!(cli.command, Command::Run { .. }) {
        log::init_with_debug(cli.debug);
    }

    match cli.command {
        Command::Run { config } => run_bridge(&config, cli.debug),
        Command::Lead(command) => run_command(&Config::load()?, command),
    }
}

fn run_command(config: &Config, command: LeadCommand) -> Result<()> {
    match command {
        LeadCommand::Status { team, json } => run_status(config, &team, json),
        LeadCommand::Tasks { team, json } => run_tasks(config, &team, json),
        LeadCommand::Audit {
            team,
            event,
            worker,
            since_minutes,
            limit,
            json,
        } => {
            let filter = AuditFilter {
                event_type: event.as_deref().map(parse_event_type).transpose()?,
                worker_name: worker,
                since: since_minutes.map(|m| Utc::now() - ChronoDuration::minutes(m)),
            };
            run_audit(config, &team, &filter, limit, json)
        }
        LeadCommand::Health { team, json } => run_health(config, &team, json),
        LeadCommand::Messages {
            team,
            worker,
            all,
            json,
        } => run_messages(config, &team, worker.as_deref(), all, json),
        LeadCommand::Send {
            team,
            worker,
            message,
            context,
        } => {
            let team = open_team(config, &team)?;
            let kind = if context {
                InboxMessageType::Context
            } else {
                InboxMessageType::Message
            };
            team.mailbox
                .append_inbox(&worker, &InboxMessage::new(kind, message))?;
            println!("Sent to {}", worker);
            Ok(())
        }
        LeadCommand::Shutdown {
            team,
            worker,
            reason,
        } => {
            let team = open_team(config, &team)?;
            let signal = team.mailbox.write_shutdown_signal(&worker, &reason)?;
            println!("Shutdown requested for {} ({})", worker, signal.request_id);
            Ok(())
        }
        LeadCommand::Drain {
            team,
            worker,
            reason,
        } => {
            let team = open_team(config, &team)?;
            let signal = team.mailbox.write_drain_signal(&worker, &reason)?;
            println!("Drain requested for {} ({})", worker, signal.request_id);
            Ok(())
        }
        LeadCommand::Teardown { team, worker } => run_teardown(config, &team, &worker),
        LeadCommand::Supervise {
            team,
            interval,
            once,
            json,
        } => run_supervise(config, &team, Duration::from_secs(interval), once, json),
    }
}

fn open_team(config: &Config, args: &TeamArgs) -> Result<Team> {
    let work_dir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let layout = Layout::from_config(config, work_dir)?;
    Team::open(&layout, &args.team, config.restart.clone())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_event_type(name: &str) -> Result<AuditEventType> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| Error::Validation(format!("Unknown audit event type: {name}")))
}

fn load_bridge_config(path: &Path) -> Result<BridgeConfig> {
    let home = dirs::home_dir().ok_or(Error::NoHomeDir)?;
    let home = home.canonicalize().unwrap_or(home);
    let resolved = path.canonicalize()?;
    if !validate_config_path(&resolved, &home) {
        return Err(Error::PathEscape {
            path: resolved,
            base: home,
        });
    }
    let mut config = BridgeConfig::load(&resolved)?;
    config.working_directory = validate_working_directory(&config.working_directory)?;
    Ok(config)
}

fn run_bridge(config_path: &Path, debug: bool) -> Result<()> {
    let config = match load_bridge_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            log::init_with_debug(debug);
            tlog_error!("Invalid bridge config {}: {}", config_path.display(), e);
            return Err(e);
        }
    };

    let layout = config.layout()?;
    log::init_at(
        &layout.bridge_log_path(&config.team_name, &config.worker_name)?,
        debug,
    );
    tlog!(
        "Bridge process {} for {}/{}",
        std::process::id(),
        config.team_name,
        config.worker_name
    );

    let executor = Arc::new(CliExecutor::new(config.provider)?);
    let cancel = CancellationToken::new();
    let bridge = Bridge::new(config, executor)?.with_cancellation(cancel.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        tokio::spawn(wait_for_stop_signal(cancel));
        match bridge.run().await? {
            BridgeExit::Shutdown { request_id } => tlog!("Shut down on request {}", request_id),
            BridgeExit::Drained { request_id } => tlog!("Drained on request {}", request_id),
            BridgeExit::Cancelled => tlog!("Stopped by signal"),
        }
        Ok(())
    })
}

async fn wait_for_stop_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tlog_warn!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tlog!("SIGINT received"),
            _ = term.recv() => tlog!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tlog!("Ctrl-C received");
    }
    cancel.cancel();
}

fn run_status(config: &Config, args: &TeamArgs, json: bool) -> Result<()> {
    let team = open_team(config, args)?;
    let status = get_team_status(&team, config.heartbeat_max_age());
    if json {
        return print_json(&status);
    }

    let s = &status.task_summary;
    println!("Team {} ({})", status.team_name, status.phase);
    println!(
        "Tasks: {} total, {} completed, {} failed, {} in progress, {} pending",
        s.total, s.completed, s.failed, s.in_progress, s.pending
    );
    if !status.stuck_tasks.is_empty() {
        println!("Stuck: {}", status.stuck_tasks.join(", "));
    }
    if status.workers.is_empty() {
        println!("No registered workers");
    }
    for w in &status.workers {
        let state = w
            .heartbeat
            .as_ref()
            .map(|b| b.state.to_string())
            .unwrap_or_else(|| "no heartbeat".to_string());
        let current = w
            .current_task
            .as_ref()
            .map(|t| format!(" on #{}", t.id))
            .unwrap_or_default();
        println!(
            "  {:<16} {:<7} {}{}{}  ({} done, {} failed)",
            w.worker_name,
            w.provider,
            state,
            if w.is_alive { "" } else { " [dead]" },
            current,
            w.task_stats.completed,
            w.task_stats.failed
        );
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskRow {
    id: String,
    status: String,
    owner: String,
    subject: Option<String>,
    blocked_by: Vec<String>,
    retry_count: u32,
    last_error: Option<String>,
}

fn run_tasks(config: &Config, args: &TeamArgs, json: bool) -> Result<()> {
    let team = open_team(config, args)?;
    let tasks = team.tasks.read_all_tasks();
    let report = analyze_blockers(&tasks);

    let rows: Vec<TaskRow> = tasks
        .iter()
        .map(|t| {
            let failure = team.tasks.read_task_failure(&t.id).ok().flatten();
            let status = if t.is_permanently_failed() {
                "failed".to_string()
            } else {
                serde_json::to_value(t.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            };
            TaskRow {
                id: t.id.clone(),
                status,
                owner: t.owner.clone(),
                subject: t.subject.clone(),
                blocked_by: t.blocked_by.clone(),
                retry_count: failure.as_ref().map_or(0, |f| f.retry_count),
                last_error: failure.map(|f| f.last_error),
            }
        })
        .collect();

    if json {
        return print_json(&serde_json::json!({ "tasks": rows, "blockers": report }));
    }

    for row in &rows {
        let blockers = if row.blocked_by.is_empty() {
            String::new()
        } else {
            format!("  blocked by {}", row.blocked_by.join(","))
        };
        let retries = if row.retry_count > 0 {
            format!("  ({} failures)", row.retry_count)
        } else {
            String::new()
        };
        println!(
            "#{:<6} {:<12} {:<14} {}{}{}",
            row.id,
            row.status,
            row.owner,
            row.subject.as_deref().unwrap_or(""),
            blockers,
            retries
        );
    }
    for cycle in &report.cycles {
        println!("Cycle: {}", cycle.join(" -> "));
    }
    for (task, missing) in &report.dangling {
        println!("#{} is blocked by missing task #{}", task, missing);
    }
    Ok(())
}

fn run_audit(
    config: &Config,
    args: &TeamArgs,
    filter: &AuditFilter,
    limit: usize,
    json: bool,
) -> Result<()> {
    let team = open_team(config, args)?;
    let mut events = team.audit.read(filter);
    if events.len() > limit {
        events.drain(..events.len() - limit);
    }
    if json {
        return print_json(&events);
    }
    for e in &events {
        let kind = serde_json::to_value(e.event_type)?;
        println!(
            "{} {:<24} {:<14} {}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            kind.as_str().unwrap_or(""),
            e.worker_name.as_deref().unwrap_or("-"),
            e.task_id.as_deref().map(|t| format!("#{t}")).unwrap_or_default()
        );
    }
    Ok(())
}

fn run_health(config: &Config, args: &TeamArgs, json: bool) -> Result<()> {
    let team = open_team(config, args)?;
    let reports = worker_health_reports(&team, config.heartbeat_max_age());
    if json {
        return print_json(&reports);
    }
    for r in &reports {
        if r.is_healthy() {
            println!("{:<16} ok", r.worker_name);
        } else {
            let issues: Vec<String> = r.issues.iter().map(|i| i.to_string()).collect();
            println!("{:<16} {}", r.worker_name, issues.join("; "));
        }
    }
    Ok(())
}

fn run_messages(
    config: &Config,
    args: &TeamArgs,
    worker: Option<&str>,
    all: bool,
    json: bool,
) -> Result<()> {
    let team = open_team(config, args)?;
    let batches = match worker {
        Some(w) if all => vec![(w.to_string(), team.mailbox.read_all_outbox_messages(w)?)],
        Some(w) => vec![(w.to_string(), team.mailbox.read_new_outbox_messages(w)?)],
        None if all => team
            .registry
            .list()
            .into_iter()
            .map(|m| {
                let messages = team.mailbox.read_all_outbox_messages(&m.name)?;
                Ok((m.name, messages))
            })
            .collect::<Result<Vec<_>>>()?,
        None => team.mailbox.read_all_team_outbox_messages()?,
    };

    if json {
        let map: serde_json::Map<String, serde_json::Value> = batches
            .into_iter()
            .map(|(w, msgs)| Ok((w, serde_json::to_value(msgs)?)))
            .collect::<Result<_>>()?;
        return print_json(&map);
    }
    for (w, messages) in &batches {
        for m in messages {
            let kind = serde_json::to_value(m.message_type)?;
            let text = m
                .summary
                .as_deref()
                .or(m.message.as_deref())
                .or(m.error.as_deref())
                .unwrap_or("");
            println!(
                "{} {:<14} {:<18} {}{}",
                m.timestamp.format("%H:%M:%S"),
                w,
                kind.as_str().unwrap_or(""),
                m.task_id.as_deref().map(|t| format!("#{t} ")).unwrap_or_default(),
                text
            );
        }
    }
    Ok(())
}

fn run_teardown(config: &Config, args: &TeamArgs, worker: &str) -> Result<()> {
    let team = open_team(config, args)?;
    let session = session_name(team.name(), worker)?;
    if TmuxHost::is_available() && TmuxHost.is_session_alive(&session) {
        TmuxHost.kill_session(&session)?;
    }
    team.teardown_worker(worker)?;
    println!("Removed {}", worker);
    Ok(())
}

fn run_supervise(
    config: &Config,
    args: &TeamArgs,
    interval: Duration,
    once: bool,
    json: bool,
) -> Result<()> {
    TmuxHost::validate()?;
    let team = open_team(config, args)?;
    let max_age = config.heartbeat_max_age();
    tlog!("Supervising team {} every {:?}", team.name(), interval);

    let pass = |team: &Team| -> Result<()> {
        let reports = supervise_once(team, &TmuxHost, max_age)?;
        if json {
            print_json(&reports)
        } else {
            for r in &reports {
                println!("{:<16} {:?}", r.worker_name, r.action);
            }
            Ok(())
        }
    };

    if once {
        return pass(&team);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        loop {
            if let Err(e) = pass(&team) {
                tlog_error!("Supervisor pass failed: {}", e);
                eprintln!("Supervisor pass failed: {}", e);
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tlog!("Supervisor for {} stopped", team.name());
        Ok(())
    })
}
