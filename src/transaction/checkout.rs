// ============================================================================
// Object Check-out Table
// ============================================================================
//
// A committed object may be checked out by one open transaction at a time.
// The claim is taken before the committed state is read and released only
// after the transaction commits or is discarded, so a second editor either
// waits for the first to finish or sees its committed result.
//
// ============================================================================

use super::TransactionId;
use crate::core::{DbError, Invid, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone)]
struct Claim {
    txn: TransactionId,
    holder: String,
}

#[derive(Debug, Default)]
pub struct CheckoutTable {
    claims: Mutex<HashMap<Invid, Claim>>,
}

impl CheckoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<Invid, Claim>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `invid` for `txn`. Claiming an object the transaction already
    /// holds is a no-op; an object held by another transaction is
    /// [`DbError::ObjectBusy`].
    pub fn claim(&self, invid: Invid, txn: TransactionId, holder: &str) -> Result<()> {
        let mut claims = self.claims();
        match claims.get(&invid) {
            Some(claim) if claim.txn == txn => Ok(()),
            Some(claim) => Err(DbError::ObjectBusy {
                invid,
                holder: claim.holder.clone(),
            }),
            None => {
                claims.insert(
                    invid,
                    Claim {
                        txn,
                        holder: holder.to_string(),
                    },
                );
                Ok(())
            }
        }
    }

    pub fn release(&self, invid: Invid, txn: TransactionId) {
        let mut claims = self.claims();
        if claims.get(&invid).is_some_and(|c| c.txn == txn) {
            claims.remove(&invid);
        }
    }

    /// Drop the claims of `txn` for which `keep` returns false.
    pub fn release_unless(&self, txn: TransactionId, keep: impl Fn(Invid) -> bool) {
        self.claims().retain(|invid, c| c.txn != txn || keep(*invid));
    }

    /// Drop every claim held by `txn`.
    pub fn release_all(&self, txn: TransactionId) {
        let mut claims = self.claims();
        let before = claims.len();
        claims.retain(|_, c| c.txn != txn);
        let released = before - claims.len();
        if released > 0 {
            debug!(%txn, released, "check-outs released");
        }
    }

    /// Name of the session holding `invid`, if any.
    pub fn holder(&self, invid: Invid) -> Option<String> {
        self.claims().get(&invid).map(|c| c.holder.clone())
    }

    pub fn len(&self) -> usize {
        self.claims().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims().is_empty()
    }
}
