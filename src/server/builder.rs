//! Builder tasks: scheduled jobs that export data from the store.
//!
//! A build runs in two phases. Phase 1 holds a dump lock, so it sees a
//! consistent store and blocks commits while it runs; it should only scan
//! and write out what phase 2 needs. Phase 2 runs without any lock and may
//! take as long as it likes, but holds a permit on the build gate so
//! shutdown waits for it to finish.

use super::{Shared, internal_owner};
use crate::core::{BaseId, Result as DbResult};
use crate::lock::{LockKind, LockScope};
use crate::scheduler::{Interrupt, Task, TaskContext};
use crate::session::AdmissionSemaphore;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Task option that makes phase 1 run even when nothing changed.
pub const FORCE_BUILD: &str = "forcebuild";

/// What phase 1 gets to look at.
pub struct BuildView<'a> {
    store: &'a ObjectStore,
    since: Option<DateTime<Utc>>,
    forced: bool,
}

impl<'a> BuildView<'a> {
    pub fn store(&self) -> &'a ObjectStore {
        self.store
    }

    /// Start of the previous build, if there was one.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// True if `base` changed since the previous build (always true on the
    /// first build or when forced).
    pub fn base_changed(&self, base: BaseId) -> DbResult<bool> {
        if self.forced || self.since.is_none() {
            return Ok(true);
        }
        self.store.changed_since(&[base], self.since)
    }
}

#[async_trait]
pub trait Builder: Send + Sync + 'static {
    /// Bases whose changes call for a rebuild. Empty means every base.
    fn watched_bases(&self) -> Vec<BaseId> {
        Vec::new()
    }

    /// Runs under a dump lock. Return true to go on to phase 2.
    fn phase1(&self, view: &BuildView<'_>) -> anyhow::Result<bool>;

    /// Runs outside any lock, e.g. to hand the exported files to an
    /// external service. Should return early once `interrupt` is set.
    async fn phase2(&self, interrupt: &Interrupt) -> anyhow::Result<()>;
}

/// Build gate permit, returned on drop so a panicking phase 2 cannot wedge
/// shutdown.
struct BuildPermit<'a>(&'a AdmissionSemaphore);

impl Drop for BuildPermit<'_> {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Scheduler task driving a [`Builder`].
pub struct BuilderTask<B> {
    name: String,
    builder: B,
    server: Weak<Shared>,
    last_build: Mutex<Option<DateTime<Utc>>>,
}

impl<B: Builder> BuilderTask<B> {
    pub(crate) fn new(name: &str, builder: B, server: Weak<Shared>) -> Self {
        Self {
            name: name.to_string(),
            builder,
            server,
            last_build: Mutex::new(None),
        }
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn last_build(&self) -> Option<DateTime<Utc>> {
        *self.last_build.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_build(&self, now: DateTime<Utc>) {
        *self.last_build.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    /// Phase 1 under a dump lock. Returns whether phase 2 should run.
    async fn phase1(&self, shared: &Shared, forced: bool) -> anyhow::Result<bool> {
        let owner = internal_owner(&format!("builder {}", self.name));
        let _lock = shared
            .locks
            .acquire(&owner, LockKind::Dump, LockScope::All, None)
            .await?
            .into_result()?;

        let mut bases = self.builder.watched_bases();
        if bases.is_empty() {
            bases = shared.store.base_ids()?;
        }
        let since = self.last_build();
        if !forced && since.is_some() && !shared.store.changed_since(&bases, since)? {
            debug!(builder = %self.name, "nothing changed since the last build");
            return Ok(false);
        }

        self.mark_build(shared.clock.now());
        let view = BuildView {
            store: &shared.store,
            since,
            forced,
        };
        self.builder.phase1(&view)
    }
}

#[async_trait]
impl<B: Builder> Task for BuilderTask<B> {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        let Some(shared) = self.server.upgrade() else {
            return Ok(());
        };
        if let Some(state) = shared.build_gate.check_enabled() {
            debug!(builder = %self.name, %state, "build skipped");
            return Ok(());
        }
        let forced = ctx
            .options
            .iter()
            .flatten()
            .any(|option| option == FORCE_BUILD);

        let run_phase2 = self.phase1(&shared, forced).await?;
        if ctx.interrupt.is_set() {
            info!(builder = %self.name, "build interrupted after phase 1");
            return Ok(());
        }
        if !run_phase2 {
            return Ok(());
        }

        if let Err(state) = shared.build_gate.increment(Duration::ZERO).await {
            debug!(builder = %self.name, %state, "phase 2 skipped");
            return Ok(());
        }
        let _permit = BuildPermit(&shared.build_gate);
        self.builder.phase2(&ctx.interrupt).await?;
        info!(builder = %self.name, "build complete");
        Ok(())
    }
}

impl Shared {
    /// Ask every registered builder to run (or run again) after a commit.
    pub(crate) fn demand_builders(&self) {
        for name in self.builder_names() {
            if let Err(e) = self.scheduler.demand_task(&name) {
                debug!(builder = %name, error = %e, "builder not demanded");
            }
        }
    }
}
