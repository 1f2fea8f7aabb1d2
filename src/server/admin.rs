use super::Server;
use super::maintenance::InvidReport;
use super::shutdown::ServerState;
use crate::audit::AuditEvent;
use crate::core::{DbError, Result};
use crate::lock::LockInfo;
use crate::scheduler::TaskInfo;
use crate::session::{AdminPrivilege, SessionSummary};
use crate::storage::DumpMetadata;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// Change notices pushed to attached admin consoles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AdminEvent {
    SessionOpened { name: String, host: String },
    SessionClosed { name: String, reason: String, forced: bool },
    TasksChanged,
    LocksHeld(usize),
    State(ServerState),
    /// Free-text server notice.
    Message(String),
}

/// An attached admin console.
///
/// Viewing needs [`AdminPrivilege::Basic`]; anything that changes server
/// state needs [`AdminPrivilege::Full`].
pub struct AdminSession {
    id: Uuid,
    name: String,
    privilege: AdminPrivilege,
    server: Server,
}

impl std::fmt::Debug for AdminSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSession")
            .field("name", &self.name)
            .field("privilege", &self.privilege)
            .finish_non_exhaustive()
    }
}

impl AdminSession {
    pub(crate) fn new(name: String, privilege: AdminPrivilege, server: Server) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            privilege,
            server,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn privilege(&self) -> AdminPrivilege {
        self.privilege
    }

    fn require_control(&self, action: &str) -> Result<()> {
        if self.privilege.can_control() {
            Ok(())
        } else {
            Err(DbError::PermissionDenied(format!(
                "{} lacks the privileges to {}",
                self.name, action
            )))
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdminEvent> {
        self.server.subscribe()
    }

    pub async fn user_table(&self) -> Vec<SessionSummary> {
        self.server.user_table().await
    }

    pub fn task_table(&self) -> Vec<TaskInfo> {
        self.server.scheduler().task_table()
    }

    pub fn locks(&self) -> Vec<LockInfo> {
        self.server.locks().locks()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<AuditEvent> {
        self.server.audit().recent(limit)
    }

    pub fn state(&self) -> ServerState {
        self.server.state()
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    pub async fn kill_user(&self, name: &str, reason: &str) -> Result<bool> {
        self.require_control("kill users")?;
        Ok(self.server.kill_user(name, reason).await)
    }

    pub async fn kill_all_users(&self, reason: &str) -> Result<usize> {
        self.require_control("kill users")?;
        Ok(self.server.kill_all_users(reason).await)
    }

    /// Send `text` to every live session's inbox.
    pub fn broadcast(&self, text: &str) -> Result<usize> {
        self.require_control("broadcast")?;
        Ok(self.server.broadcast(&self.name, text))
    }

    pub fn run_task(&self, task: &str) -> Result<bool> {
        self.require_control("run tasks")?;
        self.server.scheduler().run_task_now(task)
    }

    pub fn stop_task(&self, task: &str) -> Result<bool> {
        self.require_control("stop tasks")?;
        self.server.scheduler().stop_task(task)
    }

    pub fn disable_task(&self, task: &str) -> Result<()> {
        self.require_control("disable tasks")?;
        self.server.scheduler().disable_task(task)
    }

    pub fn enable_task(&self, task: &str) -> Result<()> {
        self.require_control("enable tasks")?;
        self.server.scheduler().enable_task(task)
    }

    pub async fn dump(&self) -> Result<DumpMetadata> {
        self.require_control("dump the database")?;
        self.server.dump().await
    }

    pub async fn sweep_invids(&self) -> Result<usize> {
        self.require_control("sweep invids")?;
        self.server.sweep_invids().await
    }

    pub async fn check_invids(&self) -> Result<InvidReport> {
        self.require_control("check invids")?;
        self.server.check_invids().await
    }

    /// Shut the server down now, or once the last user has logged out.
    pub async fn shutdown(&self, wait_for_users: bool, reason: Option<&str>) -> Result<()> {
        self.require_control("shut down the server")?;
        info!(admin = %self.name, wait_for_users, reason, "shutdown requested from console");
        if wait_for_users {
            self.server.set_shutdown(reason).await
        } else {
            self.server.shutdown(reason).await
        }
    }
}
