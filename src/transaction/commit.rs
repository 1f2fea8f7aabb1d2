// ============================================================================
// Commit Validation
// ============================================================================
//
// Runs against the proposed post-commit view (store overlaid with the edit
// set) while the committing session holds a write lock over every base the
// commit can observe. The first failure aborts the commit; nothing is
// installed until every check has passed.
//
// ============================================================================

use super::EditSet;
use crate::core::{BaseId, DbError, DbObject, Invid, Result};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Read-only view of the database as it would look after commit.
pub struct CommitView<'a> {
    store: &'a ObjectStore,
    edits: &'a EditSet,
}

impl<'a> CommitView<'a> {
    pub fn new(store: &'a ObjectStore, edits: &'a EditSet) -> Self {
        Self { store, edits }
    }

    pub fn get(&self, invid: Invid) -> Result<Option<DbObject>> {
        match self.edits.view(invid) {
            Some(pending) => Ok(pending.cloned()),
            None => self.store.get(invid),
        }
    }

    pub fn exists(&self, invid: Invid) -> Result<bool> {
        match self.edits.view(invid) {
            Some(pending) => Ok(pending.is_some()),
            None => self.store.contains(invid),
        }
    }

    pub fn edits(&self) -> &EditSet {
        self.edits
    }

    pub fn store(&self) -> &ObjectStore {
        self.store
    }
}

/// Pre-commit hook. Returning `Err(reason)` vetoes the commit.
#[async_trait]
pub trait CommitHook: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, view: &CommitView<'_>) -> std::result::Result<(), String>;
}

/// Every base the commit reads or writes: touched bases, the bases of
/// referenced objects, and the bases of objects pointing at deleted ones.
pub fn commit_scope(store: &ObjectStore, edits: &EditSet) -> Result<BTreeSet<BaseId>> {
    let mut bases = edits.touched_bases();
    for change in edits.changes() {
        if let Some(obj) = change.current() {
            bases.extend(obj.references().map(|(_, target)| target.base));
        }
        if change.current().is_none() {
            bases.extend(store.backlinks(change.invid())?.into_iter().map(|h| h.base));
        }
    }
    Ok(bases)
}

/// Every checked-out original must still match the stored object. Catches
/// changes installed outside the check-out protocol, such as an invid sweep.
pub fn ensure_current(store: &ObjectStore, edits: &EditSet) -> Result<()> {
    for change in edits.changes() {
        if let Some(original) = change.original() {
            if store.get(change.invid())?.as_ref() != Some(original) {
                return Err(DbError::ObjectChanged(change.invid()));
            }
        }
    }
    Ok(())
}

/// Schema, required-field and referential-integrity checks.
pub fn validate(view: &CommitView<'_>) -> Result<()> {
    for change in view.edits().changes() {
        let Some(obj) = change.current() else {
            check_deletion(view, change.invid())?;
            continue;
        };
        let schema = view.store().schema(obj.invid().base)?;

        for (field_id, value) in obj.fields() {
            let def = schema
                .field(field_id)
                .ok_or_else(|| DbError::FieldNotFound(field_id.to_string(), schema.name.clone()))?;
            def.validate(value).map_err(|e| DbError::ValidationFailed {
                invid: obj.invid(),
                field: def.name.clone(),
                message: e.to_string(),
            })?;
        }

        for def in schema.fields().iter().filter(|f| f.required) {
            if !obj.is_set(def.id) {
                return Err(DbError::ValidationFailed {
                    invid: obj.invid(),
                    field: def.name.clone(),
                    message: "required field is not set".to_string(),
                });
            }
        }

        for (field_id, target) in obj.references() {
            if !view.exists(target)? {
                let field = schema
                    .field(field_id)
                    .map_or_else(|| field_id.to_string(), |f| f.name.clone());
                return Err(DbError::ValidationFailed {
                    invid: obj.invid(),
                    field,
                    message: format!("references missing object {}", target),
                });
            }
        }
    }
    Ok(())
}

/// A deletion may not leave a surviving object pointing at the deleted one.
fn check_deletion(view: &CommitView<'_>, deleted: Invid) -> Result<()> {
    for holder in view.store().backlinks(deleted)? {
        let Some(proposed) = view.get(holder)? else {
            continue;
        };
        if let Some((field_id, _)) = proposed.references().find(|(_, t)| *t == deleted) {
            let field = view
                .store()
                .schema(holder.base)?
                .field(field_id)
                .map_or_else(|| field_id.to_string(), |f| f.name.clone());
            return Err(DbError::ValidationFailed {
                invid: holder,
                field,
                message: format!("still references deleted object {}", deleted),
            });
        }
    }
    Ok(())
}

/// Run hooks in registration order. The first veto wins.
pub async fn run_hooks(view: &CommitView<'_>, hooks: &[std::sync::Arc<dyn CommitHook>]) -> Result<()> {
    for hook in hooks {
        if let Err(reason) = hook.check(view).await {
            return Err(DbError::CommitVetoed(format!("{}: {}", hook.name(), reason)));
        }
    }
    Ok(())
}
