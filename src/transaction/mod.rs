// ============================================================================
// Transaction Module
// ============================================================================
//
// Per-session edit sets with named checkpoints, exclusive object check-out,
// and the commit protocol: write-lock the commit scope, confirm checked-out
// originals are still current, validate the proposed view, run commit hooks,
// then install every change in one store update or none at all.
//
// Design Patterns Used:
// - State Pattern: Transaction state management (Active, Committed, Aborted)
// - Memento: checkpoints capture the pending change map
//
// ============================================================================

pub mod change;
pub mod checkout;
pub mod commit;
pub mod state;

pub use change::ObjectChange;
pub use checkout::CheckoutTable;
pub use commit::{CommitHook, CommitView, commit_scope, ensure_current, run_hooks, validate};
pub use state::{EditSet, TransactionId, TransactionState};
