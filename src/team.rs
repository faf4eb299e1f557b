use std::time::Duration;

use crate::audit::AuditLog;
use crate::config::Layout;
use crate::fs_util::remove_if_exists;
use crate::heartbeat::HeartbeatRegistry;
use crate::mailbox::Mailbox;
use crate::registry::WorkerRegistry;
use crate::restart::{RestartPolicy, RestartTracker};
use crate::task::TaskStore;
use crate::Result;

/// Every store of one team, opened against one layout.
#[derive(Debug, Clone)]
pub struct Team {
    name: String,
    layout: Layout,
    pub tasks: TaskStore,
    pub audit: AuditLog,
    pub heartbeats: HeartbeatRegistry,
    pub mailbox: Mailbox,
    pub registry: WorkerRegistry,
    pub restarts: RestartTracker,
}

impl Team {
    /// Fails fast on a team name outside the allow-list.
    pub fn open(layout: &Layout, name: &str, policy: RestartPolicy) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            layout: layout.clone(),
            tasks: TaskStore::new(layout, name)?,
            audit: AuditLog::new(layout, name)?,
            heartbeats: HeartbeatRegistry::new(layout, name)?,
            mailbox: Mailbox::new(layout, name)?,
            registry: WorkerRegistry::new(layout, name)?,
            restarts: RestartTracker::new(layout, name, policy)?,
        })
    }

    pub fn with_claim_delay(mut self, delay: Duration) -> Self {
        self.tasks = self.tasks.with_claim_delay(delay);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Remove every liveness, messaging and registration artifact of a
    /// worker, plus its synthesized bridge config. Task files and the audit
    /// log are untouched.
    pub fn teardown_worker(&self, worker: &str) -> Result<()> {
        self.mailbox.cleanup_worker_files(worker)?;
        self.heartbeats.delete(worker)?;
        self.registry.unregister(worker)?;
        self.restarts.clear_restart_state(worker)?;
        remove_if_exists(&self.layout.bridge_config_path(&self.name, worker)?)?;
        Ok(())
    }
}
