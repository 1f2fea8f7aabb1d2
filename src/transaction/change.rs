// ============================================================================
// Pending Object Changes
// ============================================================================
//
// One entry per object touched by a transaction. The entry keeps the
// committed state the transaction started from (if any) next to the working
// copy, so commit knows what to install and validation knows which
// back-links a deletion would strand.
//
// ============================================================================

use crate::core::{BaseId, DbObject, Invid};

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectChange {
    /// Object created in this transaction.
    Create { object: DbObject },

    /// Committed object checked out for editing.
    Edit { original: DbObject, object: DbObject },

    /// Committed object marked for deletion.
    Delete { original: DbObject },
}

impl ObjectChange {
    pub fn invid(&self) -> Invid {
        match self {
            ObjectChange::Create { object } => object.invid(),
            ObjectChange::Edit { object, .. } => object.invid(),
            ObjectChange::Delete { original } => original.invid(),
        }
    }

    pub fn base(&self) -> BaseId {
        self.invid().base
    }

    /// State the object will have after commit. `None` for deletions.
    pub fn current(&self) -> Option<&DbObject> {
        match self {
            ObjectChange::Create { object } | ObjectChange::Edit { object, .. } => Some(object),
            ObjectChange::Delete { .. } => None,
        }
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut DbObject> {
        match self {
            ObjectChange::Create { object } | ObjectChange::Edit { object, .. } => Some(object),
            ObjectChange::Delete { .. } => None,
        }
    }

    /// Committed state before this transaction. `None` for creations.
    pub fn original(&self) -> Option<&DbObject> {
        match self {
            ObjectChange::Create { .. } => None,
            ObjectChange::Edit { original, .. } | ObjectChange::Delete { original } => Some(original),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjectChange::Create { .. } => "create",
            ObjectChange::Edit { .. } => "edit",
            ObjectChange::Delete { .. } => "delete",
        }
    }

    /// An edit that ended up identical to its original.
    pub fn is_noop(&self) -> bool {
        matches!(self, ObjectChange::Edit { original, object } if original == object)
    }
}
