// ============================================================================
// Lock Manager
// ============================================================================
//
// Base-scoped read / write / dump locks.
//
// - Readers coexist with each other and with dumps.
// - A writer excludes readers, other writers and dumps on every base it covers.
// - Writers queue FIFO per base; once a writer is queued, new readers wait
//   behind it.
// - A dump, once queued, blocks new writers from queueing, and is granted
//   when the writers ahead of it drain. Dumps lock out writers only; they
//   do not take a snapshot.
//
// ============================================================================

pub mod manager;

pub use manager::{LockGuard, LockManager};

use crate::core::{BaseId, DbError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockKind {
    Read,
    Write,
    Dump,
}

impl LockKind {
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, LockKind::Read)
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Read => write!(f, "read"),
            LockKind::Write => write!(f, "write"),
            LockKind::Dump => write!(f, "dump"),
        }
    }
}

/// Which object bases a lock covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    /// Every base known to the manager when the request is made.
    All,
    Bases(Vec<BaseId>),
}

impl LockScope {
    pub fn base(base: BaseId) -> Self {
        LockScope::Bases(vec![base])
    }

    pub fn bases(bases: impl IntoIterator<Item = BaseId>) -> Self {
        let mut bases: Vec<BaseId> = bases.into_iter().collect();
        bases.sort_unstable();
        bases.dedup();
        LockScope::Bases(bases)
    }
}

/// Outcome of a lock request. Every arm must be handled by the caller.
#[derive(Debug)]
pub enum LockResult {
    Granted(LockGuard),
    /// The request was aborted before grant (owner forced off, manager closed).
    Cancelled,
    TimedOut,
}

impl LockResult {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockResult::Granted(_))
    }

    /// Collapse into a `Result`, mapping the non-grant arms to their errors.
    pub fn into_result(self) -> Result<LockGuard> {
        match self {
            LockResult::Granted(guard) => Ok(guard),
            LockResult::Cancelled => Err(DbError::LockCancelled),
            LockResult::TimedOut => Err(DbError::LockTimedOut),
        }
    }
}

/// Snapshot of one lock request for admin display.
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub id: u64,
    pub owner: String,
    pub kind: LockKind,
    pub bases: Vec<BaseId>,
    pub granted: bool,
    pub requested_at: DateTime<Utc>,
}
