// ============================================================================
// Transaction State Management
// ============================================================================
//
// State Pattern for the transaction lifecycle: Active -> Committed/Aborted.
//
// An EditSet is private to one session until commit. Other sessions never see
// its working copies; commit installs them into the store in one step.
//
// ============================================================================

use super::ObjectChange;
use crate::core::{BaseId, DbError, DbObject, Invid, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug, Clone)]
struct Checkpoint {
    label: String,
    changes: BTreeMap<Invid, ObjectChange>,
}

/// The pending changes of one open transaction, plus its checkpoint stack.
#[derive(Debug)]
pub struct EditSet {
    id: TransactionId,
    description: String,
    interactive: bool,
    state: TransactionState,
    opened_at: DateTime<Utc>,
    changes: BTreeMap<Invid, ObjectChange>,
    checkpoints: Vec<Checkpoint>,
}

impl EditSet {
    pub fn new(description: impl Into<String>, interactive: bool, opened_at: DateTime<Utc>) -> Self {
        Self {
            id: TransactionId::new(),
            description: description.into(),
            interactive,
            state: TransactionState::Active,
            opened_at,
            changes: BTreeMap::new(),
            checkpoints: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn changes(&self) -> impl Iterator<Item = &ObjectChange> {
        self.changes.values()
    }

    pub fn change(&self, invid: Invid) -> Option<&ObjectChange> {
        self.changes.get(&invid)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Committed objects this transaction has checked out for edit or delete.
    pub fn checked_out_count(&self) -> usize {
        self.changes
            .values()
            .filter(|c| c.original().is_some())
            .count()
    }

    pub fn touched_bases(&self) -> BTreeSet<BaseId> {
        self.changes.keys().map(|i| i.base).collect()
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::TransactionOpen(format!(
                "transaction {} is {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// The transaction's view of `invid`: `Some(None)` if deleted here,
    /// `None` if this transaction has not touched it.
    pub fn view(&self, invid: Invid) -> Option<Option<&DbObject>> {
        self.changes.get(&invid).map(|c| c.current())
    }

    pub fn create(&mut self, object: DbObject) -> Result<()> {
        self.ensure_active()?;
        self.changes
            .insert(object.invid(), ObjectChange::Create { object });
        Ok(())
    }

    /// Working copy of an object already in this transaction.
    pub fn working_mut(&mut self, invid: Invid) -> Option<&mut DbObject> {
        self.changes.get_mut(&invid).and_then(|c| c.current_mut())
    }

    /// Check `original` out for editing, or return the existing working copy.
    pub fn checkout(&mut self, original: DbObject) -> Result<&mut DbObject> {
        self.ensure_active()?;
        let invid = original.invid();
        let change = self.changes.entry(invid).or_insert_with(|| ObjectChange::Edit {
            object: original.clone(),
            original,
        });
        change.current_mut().ok_or(DbError::ObjectNotFound(invid))
    }

    /// Mark `invid` deleted. `original` is the committed state, required
    /// when the object has not been touched by this transaction yet.
    pub fn delete(&mut self, invid: Invid, original: Option<DbObject>) -> Result<()> {
        self.ensure_active()?;
        match self.changes.remove(&invid) {
            // created and deleted in the same transaction: nothing to commit
            Some(ObjectChange::Create { .. }) => Ok(()),
            Some(ObjectChange::Edit { original, .. }) => {
                self.changes.insert(invid, ObjectChange::Delete { original });
                Ok(())
            }
            Some(deleted @ ObjectChange::Delete { .. }) => {
                self.changes.insert(invid, deleted);
                Err(DbError::ObjectNotFound(invid))
            }
            None => {
                let original = original.ok_or(DbError::ObjectNotFound(invid))?;
                self.changes.insert(invid, ObjectChange::Delete { original });
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Push a mark. Labels need not be unique.
    pub fn checkpoint(&mut self, label: impl Into<String>) -> Result<()> {
        self.ensure_active()?;
        self.checkpoints.push(Checkpoint {
            label: label.into(),
            changes: self.changes.clone(),
        });
        Ok(())
    }

    pub fn checkpoint_labels(&self) -> Vec<&str> {
        self.checkpoints.iter().map(|c| c.label.as_str()).collect()
    }

    fn find_checkpoint(&self, label: &str) -> Result<usize> {
        self.checkpoints
            .iter()
            .rposition(|c| c.label == label)
            .ok_or_else(|| DbError::CheckpointNotFound(label.to_string()))
    }

    /// Discard the most recent mark named `label` without undoing anything.
    pub fn pop_checkpoint(&mut self, label: &str) -> Result<()> {
        let idx = self.find_checkpoint(label)?;
        self.checkpoints.remove(idx);
        Ok(())
    }

    /// Undo everything since the most recent mark named `label`. That mark
    /// and every mark above it are consumed.
    pub fn rollback_to(&mut self, label: &str) -> Result<()> {
        self.ensure_active()?;
        let idx = self.find_checkpoint(label)?;
        let checkpoint = self.checkpoints.swap_remove(idx);
        self.checkpoints.truncate(idx);
        self.changes = checkpoint.changes;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------

    pub fn abort(&mut self) {
        self.changes.clear();
        self.checkpoints.clear();
        self.state = TransactionState::Aborted;
    }

    /// Final object states to install, skipping edits that changed nothing.
    pub(crate) fn take_batch(&mut self) -> Result<Vec<(Invid, Option<DbObject>)>> {
        self.ensure_active()?;
        self.state = TransactionState::Committed;
        self.checkpoints.clear();
        Ok(std::mem::take(&mut self.changes)
            .into_iter()
            .filter(|(_, c)| !c.is_noop())
            .map(|(invid, c)| (invid, c.current().cloned()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(num: u32) -> DbObject {
        let mut obj = DbObject::new(Invid::new(300, num));
        obj.set(1, format!("host{}", num).into());
        obj
    }

    fn edit_set() -> EditSet {
        EditSet::new("test", true, Utc::now())
    }

    #[test]
    fn test_transaction_id_unique() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::Active.to_string(), "ACTIVE");
        assert!(TransactionState::Aborted.is_terminal());
    }

    #[test]
    fn test_rollback_to_latest_matching_label() {
        let mut set = edit_set();
        set.create(object(1)).unwrap();
        set.checkpoint("step").unwrap();
        set.create(object(2)).unwrap();
        set.checkpoint("step").unwrap();
        set.create(object(3)).unwrap();
        set.checkpoint("inner").unwrap();
        set.create(object(4)).unwrap();

        set.rollback_to("step").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.checkpoint_labels(), vec!["step"]);

        set.rollback_to("step").unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.checkpoint_labels().is_empty());
        assert!(matches!(
            set.rollback_to("step"),
            Err(DbError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn test_pop_checkpoint_keeps_changes() {
        let mut set = edit_set();
        set.checkpoint("a").unwrap();
        set.create(object(1)).unwrap();
        set.pop_checkpoint("a").unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.pop_checkpoint("a").is_err());
    }

    #[test]
    fn test_delete_of_created_object_vanishes() {
        let mut set = edit_set();
        set.create(object(1)).unwrap();
        set.delete(Invid::new(300, 1), None).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_checkout_then_delete_keeps_original() {
        let mut set = edit_set();
        let original = object(7);
        set.checkout(original.clone()).unwrap().set(1, "renamed".into());
        set.delete(original.invid(), None).unwrap();
        assert_eq!(set.change(original.invid()).unwrap().original(), Some(&original));
        assert_eq!(set.view(original.invid()), Some(None));
        assert!(set.checkout(original.clone()).is_err());
    }

    #[test]
    fn test_noop_edits_are_not_committed() {
        let mut set = edit_set();
        set.checkout(object(1)).unwrap();
        set.create(object(2)).unwrap();
        let batch = set.take_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(set.state(), TransactionState::Committed);
        assert!(set.create(object(3)).is_err());
    }
}
