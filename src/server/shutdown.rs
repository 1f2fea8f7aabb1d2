use super::admin::AdminEvent;
use super::{Server, Shared};
use crate::audit::{AuditEvent, AuditKind};
use crate::core::{DbError, Result};
use crate::lock::{LockResult, LockScope};
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Disable reason used on both admission gates during shutdown.
pub const SHUTDOWN_REASON: &str = "shutdown";

const SHUTDOWN_OWNER: &str = "<shutdown>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerState {
    Running,
    /// Logins are refused; shutdown runs once the last user leaves.
    ShutdownPending,
    ShuttingDown,
    ShutDown,
    /// The final dump failed and the process must exit hard.
    Failed,
}

impl ServerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerState::ShutDown | ServerState::Failed)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Running => write!(f, "running"),
            ServerState::ShutdownPending => write!(f, "shutdown pending"),
            ServerState::ShuttingDown => write!(f, "shutting down"),
            ServerState::ShutDown => write!(f, "shut down"),
            ServerState::Failed => write!(f, "failed"),
        }
    }
}

impl Shared {
    pub(crate) fn set_state(&self, state: ServerState) {
        self.state.send_replace(state);
        self.emit(AdminEvent::State(state));
    }

    /// Spawn the deferred shutdown once a pending shutdown has no users left.
    pub(crate) fn maybe_finish_deferred_shutdown(&self) {
        if *self.state.borrow() != ServerState::ShutdownPending {
            return;
        }
        if !self.registry.is_empty() || self.login_gate.count() > 0 {
            return;
        }
        let Some(shared) = self.weak_self.upgrade() else {
            return;
        };
        let grace = self.config.shutdown_grace;
        info!(?grace, "last user logged out, shutting down after grace period");
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = (Server { shared }).shutdown(None).await {
                error!(error = %e, "deferred shutdown failed");
            }
        });
    }
}

impl Server {
    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    /// Refuse new logins and shut down once the last user logs out, or at
    /// once if nobody is logged in.
    pub async fn set_shutdown(&self, reason: Option<&str>) -> Result<()> {
        let shared = &self.shared;
        if let Some(reason) = reason {
            *shared.shutdown_reason() = Some(reason.to_string());
        }
        if let Err(e) = shared.login_gate.disable(SHUTDOWN_REASON, false, None).await {
            if shared.login_gate.check_enabled().as_deref() != Some(SHUTDOWN_REASON) {
                return Err(DbError::AdmissionDenied(format!("Can't schedule shutdown: {}", e)));
            }
        }

        if shared.registry.is_empty() && shared.login_gate.count() == 0 {
            info!("no users logged in, shutting down now");
            return self.shutdown(None).await;
        }

        if self.state() == ServerState::Running {
            shared.set_state(ServerState::ShutdownPending);
        }
        info!(users = shared.registry.len(), "shutdown deferred until the last user logs out");
        // the last user may have left while the state was changing
        shared.maybe_finish_deferred_shutdown();
        Ok(())
    }

    /// Run the shutdown sequence. Calling it again while it runs, or after
    /// it finished, does nothing.
    ///
    /// Fails with [`DbError::Fatal`] if the final dump could not be made
    /// under a dump lock; the caller must then exit without further
    /// cleanup.
    pub async fn shutdown(&self, reason: Option<&str>) -> Result<()> {
        let shared = &self.shared;
        let claimed = shared.state.send_if_modified(|state| match state {
            ServerState::Running | ServerState::ShutdownPending => {
                *state = ServerState::ShuttingDown;
                true
            }
            _ => false,
        });
        if !claimed {
            debug!("shutdown already in progress");
            return Ok(());
        }
        shared.emit(AdminEvent::State(ServerState::ShuttingDown));
        if let Some(reason) = reason {
            *shared.shutdown_reason() = Some(reason.to_string());
        }

        if shared.login_gate.check_enabled().as_deref() != Some(SHUTDOWN_REASON) {
            if let Err(e) = shared.login_gate.disable(SHUTDOWN_REASON, false, None).await {
                warn!(error = %e, "shutdown refused");
                shared.set_state(ServerState::Running);
                return Err(DbError::AdmissionDenied(format!("Shutdown failed: {}", e)));
            }
        }

        info!("server going down, waiting for builder tasks to finish phase 2");
        if let Err(e) = shared.build_gate.disable(SHUTDOWN_REASON, true, None).await {
            warn!(error = %e, "build gate not closed");
        }

        info!("server going down, performing final dump");
        let dump_lock = match shared.locks.dump(SHUTDOWN_OWNER, LockScope::All).await {
            Ok(LockResult::Granted(guard)) => guard,
            Ok(LockResult::Cancelled) => return Err(shared.fail_shutdown("dump lock cancelled".to_string())),
            Ok(LockResult::TimedOut) => return Err(shared.fail_shutdown("dump lock timed out".to_string())),
            Err(e) => return Err(shared.fail_shutdown(format!("dump lock failed: {}", e))),
        };
        let dumped = shared.store.image().and_then(|image| shared.dumper.dump(image));
        match dumped {
            Ok(meta) => shared.audit.record(AuditEvent::new(
                shared.clock.now(),
                AuditKind::Dump,
                format!("final dump of {} objects", meta.object_count),
            )),
            Err(e) => return Err(shared.fail_shutdown(format!("couldn't dump the database: {}", e))),
        }

        info!("server going down, disconnecting clients");
        let notice = match shared.shutdown_reason().clone() {
            Some(reason) => format!("Server going down\n\nReason: {}", reason),
            None => "Server going down".to_string(),
        };
        for session in shared.registry.snapshot() {
            session.force_off(&notice).await;
        }

        info!("server going down, interrupting scheduler");
        let interrupted = shared.scheduler.stop();
        if interrupted > 0 {
            debug!(interrupted, "running tasks asked to stop");
        }

        drop(dump_lock);
        shared.locks.close();
        shared.emit(AdminEvent::Message(notice));

        shared.audit.record(AuditEvent::new(
            shared.clock.now(),
            AuditKind::Shutdown,
            "server shut down",
        ));
        shared.audit.close();
        shared.release_slot();
        shared.set_state(ServerState::ShutDown);
        info!("server shut down");
        Ok(())
    }

    /// Wait until the server has shut down (or failed to).
    pub async fn wait_for_shutdown(&self) -> ServerState {
        let mut state = self.shared.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }
}

impl Shared {
    fn fail_shutdown(&self, message: String) -> DbError {
        error!(%message, "shutdown aborted, exiting hard");
        self.set_state(ServerState::Failed);
        DbError::Fatal(message)
    }
}
