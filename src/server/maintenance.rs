use super::{Server, Shared, internal_owner};
use crate::audit::{AuditEvent, AuditKind};
use crate::core::{DbError, Invid, Result};
use crate::lock::{LockKind, LockScope};
use crate::storage::{DanglingRef, DumpMetadata};
use serde::Serialize;
use tracing::{info, warn};

/// Result of an invid consistency scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvidReport {
    pub dangling: Vec<DanglingRef>,
    /// Targets whose back-link index disagrees with forward references.
    pub backlink_mismatches: Vec<Invid>,
}

impl InvidReport {
    pub fn is_clean(&self) -> bool {
        self.dangling.is_empty() && self.backlink_mismatches.is_empty()
    }
}

/// Marks a sweep or check as running; cleared on drop.
struct MaintenanceGuard<'a> {
    shared: &'a Shared,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        *self.shared.maintenance() = None;
    }
}

impl Shared {
    fn begin_maintenance(&self, what: &'static str) -> Result<MaintenanceGuard<'_>> {
        let mut running = self.maintenance();
        if let Some(current) = *running {
            return Err(DbError::MaintenanceInProgress(current.to_string()));
        }
        *running = Some(what);
        Ok(MaintenanceGuard { shared: self })
    }
}

impl Server {
    /// Write the whole store to the dump file under a dump lock.
    pub async fn dump(&self) -> Result<DumpMetadata> {
        let shared = &self.shared;
        let owner = internal_owner("dump");
        let _lock = shared
            .locks
            .acquire(&owner, LockKind::Dump, LockScope::All, None)
            .await?
            .into_result()?;
        let meta = shared.dumper.dump(shared.store.image()?)?;
        shared.audit.record(AuditEvent::new(
            shared.clock.now(),
            AuditKind::Dump,
            format!("dumped {} objects in {} bases", meta.object_count, meta.base_count),
        ));
        Ok(meta)
    }

    /// Remove every reference to a missing object. Returns how many
    /// references were removed.
    pub async fn sweep_invids(&self) -> Result<usize> {
        let shared = &self.shared;
        let _running = shared.begin_maintenance("invid sweep")?;
        let _lock = shared
            .locks
            .acquire(&internal_owner("invid sweep"), LockKind::Write, LockScope::All, None)
            .await?
            .into_result()?;
        let removed = shared.store.sweep_dangling(shared.clock.now())?;
        if removed > 0 {
            warn!(removed, "invid sweep removed dangling references");
        } else {
            info!("invid sweep found no dangling references");
        }
        Ok(removed)
    }

    /// Report dangling references and back-link inconsistencies without
    /// changing anything.
    pub async fn check_invids(&self) -> Result<InvidReport> {
        let shared = &self.shared;
        let _running = shared.begin_maintenance("invid check")?;
        let _lock = shared
            .locks
            .acquire(&internal_owner("invid check"), LockKind::Dump, LockScope::All, None)
            .await?
            .into_result()?;
        let report = InvidReport {
            dangling: shared.store.dangling_references()?,
            backlink_mismatches: shared.store.backlink_mismatches()?,
        };
        if report.is_clean() {
            info!("invid check passed");
        } else {
            warn!(
                dangling = report.dangling.len(),
                backlinks = report.backlink_mismatches.len(),
                "invid check found problems"
            );
        }
        Ok(report)
    }
}
