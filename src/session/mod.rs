// ============================================================================
// Sessions
// ============================================================================
//
// One Session per logged-in principal. A session owns at most one open
// transaction; every read goes through a read lock on the bases it touches,
// and commit takes a write lock over the whole commit scope. A committed
// object is checked out by at most one open transaction at a time.
//
// Sessions hold only a weak handle to the server so the registry (which
// holds the sessions) does not keep the server alive.
//
// ============================================================================

pub mod auth;
pub mod config;
pub mod semaphore;

pub use auth::{AdminPrivilege, Identity};
pub use config::ServerConfig;
pub use semaphore::AdmissionSemaphore;

use crate::core::{BaseId, DbError, DbObject, FieldId, FieldKind, Invid, Result, Value};
use crate::lock::{LockGuard, LockKind, LockScope};
use crate::server::Shared;
use crate::storage::ObjectStore;
use crate::transaction::{EditSet, TransactionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Notice delivered to a session's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClientMessage {
    Login { name: String, count: usize },
    Logout { name: String, count: usize },
    Broadcast { from: String, text: String },
    ForcedOff { reason: String },
}

/// Admin-facing view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub logged_in_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub transaction: Option<String>,
    pub pending_changes: usize,
    pub checked_out: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogoutKind {
    Normal,
    Forced,
}

struct SessionState {
    last_activity: DateTime<Utc>,
    closed: Option<String>,
    messages: VecDeque<ClientMessage>,
}

struct SessionInner {
    id: Uuid,
    name: String,
    identity: Identity,
    host: String,
    logged_in_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    txn: tokio::sync::Mutex<Option<EditSet>>,
    server: Weak<Shared>,
}

/// Handle to a logged-in session. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        name: String,
        identity: Identity,
        host: String,
        now: DateTime<Utc>,
        server: &Arc<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                name,
                identity,
                host,
                logged_in_at: now,
                state: Mutex::new(SessionState {
                    last_activity: now,
                    closed: None,
                    messages: VecDeque::new(),
                }),
                txn: tokio::sync::Mutex::new(None),
                server: Arc::downgrade(server),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Registered session name, unique among live sessions ("alice", "alice[2]").
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn logged_in_at(&self) -> DateTime<Utc> {
        self.inner.logged_in_at
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state().last_activity
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed.is_some()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.state().closed.clone()
    }

    pub(crate) fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn push_message(&self, message: ClientMessage) {
        let mut state = self.state();
        if state.closed.is_none() {
            state.messages.push_back(message);
        }
    }

    /// Drain the inbox.
    pub fn take_messages(&self) -> Vec<ClientMessage> {
        self.state().messages.drain(..).collect()
    }

    /// First caller wins; returns false if the session was already closed.
    fn mark_closed(&self, reason: &str) -> bool {
        let mut state = self.state();
        if state.closed.is_some() {
            return false;
        }
        state.closed = Some(reason.to_string());
        true
    }

    /// Validate the session is live, stamp activity, and return the server.
    fn enter(&self) -> Result<Arc<Shared>> {
        let server = self
            .inner
            .server
            .upgrade()
            .ok_or_else(|| DbError::SessionClosed("server has shut down".to_string()))?;
        let mut state = self.state();
        if let Some(reason) = &state.closed {
            return Err(DbError::SessionClosed(reason.clone()));
        }
        state.last_activity = server.clock.now();
        Ok(server)
    }

    async fn read_lock(&self, server: &Shared, bases: impl IntoIterator<Item = BaseId>) -> Result<LockGuard> {
        server
            .locks
            .acquire(
                self.name(),
                LockKind::Read,
                LockScope::bases(bases),
                server.config.lock_timeout,
            )
            .await?
            .into_result()
    }

    async fn committed(&self, server: &Shared, invid: Invid) -> Result<DbObject> {
        let _guard = self.read_lock(server, [invid.base]).await?;
        server.store.require(invid)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Fails if a transaction is already open.
    pub async fn open_transaction(&self, description: &str, interactive: bool) -> Result<TransactionId> {
        let server = self.enter()?;
        let mut txn = self.inner.txn.lock().await;
        if let Some(open) = txn.as_ref() {
            return Err(DbError::TransactionOpen(open.description().to_string()));
        }
        let edits = EditSet::new(description, interactive, server.clock.now());
        let id = edits.id();
        debug!(session = self.name(), %id, description, "transaction opened");
        *txn = Some(edits);
        Ok(id)
    }

    pub async fn create_object(&self, base: BaseId) -> Result<Invid> {
        let server = self.enter()?;
        let mut txn = self.inner.txn.lock().await;
        let edits = txn.as_mut().ok_or(DbError::NoTransaction)?;
        server.store.schema(base)?;
        let invid = server.store.reserve_invid(base)?;
        edits.create(DbObject::new(invid))?;
        Ok(invid)
    }

    /// Committed state of `invid`, claimed for this transaction. Fails with
    /// [`DbError::ObjectBusy`] while another transaction has it checked out.
    async fn check_out(&self, server: &Shared, edits: &EditSet, invid: Invid) -> Result<DbObject> {
        server.checkouts.claim(invid, edits.id(), self.name())?;
        let original = self.committed(server, invid).await;
        if original.is_err() {
            server.checkouts.release(invid, edits.id());
        }
        original
    }

    /// Working copy of `invid` in the open transaction, checking it out from
    /// the store on first touch.
    async fn working<'a>(&self, server: &Shared, edits: &'a mut EditSet, invid: Invid) -> Result<&'a mut DbObject> {
        if edits.view(invid).is_none() {
            let original = self.check_out(server, edits, invid).await?;
            return edits.checkout(original);
        }
        edits.working_mut(invid).ok_or(DbError::ObjectNotFound(invid))
    }

    /// Set (or, with an empty value, clear) one field.
    pub async fn set_field(&self, invid: Invid, field: FieldId, value: Value) -> Result<()> {
        let server = self.enter()?;
        let schema = server.store.schema(invid.base)?;
        let def = schema.require_field(field)?;
        if matches!(def.kind, FieldKind::Password) && !matches!(value, Value::Password(_)) {
            return Err(DbError::TypeMismatch(format!(
                "Field '{}' holds a password; use set_password",
                def.name
            )));
        }
        def.validate(&value)?;

        let mut txn = self.inner.txn.lock().await;
        let edits = txn.as_mut().ok_or(DbError::NoTransaction)?;
        let obj = self.working(&server, edits, invid).await?;
        if value.is_empty() {
            obj.clear(field);
        } else {
            obj.set(field, value);
        }
        Ok(())
    }

    /// Hash `password` and store it in a password field.
    pub async fn set_password(&self, invid: Invid, field: FieldId, password: &str) -> Result<()> {
        let cost = self.enter()?.config.bcrypt_cost;
        let hash = auth::hash_password_blocking(password, cost).await?;
        self.set_field(invid, field, Value::Password(hash)).await
    }

    /// Link `target` into a reference field. Scalar fields are overwritten.
    pub async fn add_reference(&self, invid: Invid, field: FieldId, target: Invid) -> Result<()> {
        let server = self.enter()?;
        let schema = server.store.schema(invid.base)?;
        let def = schema.require_field(field)?;

        let mut txn = self.inner.txn.lock().await;
        let edits = txn.as_mut().ok_or(DbError::NoTransaction)?;
        let obj = self.working(&server, edits, invid).await?;
        let next = match (&def.kind, obj.get(field)) {
            (FieldKind::References { .. }, Some(Value::References(current))) => {
                let mut targets = current.clone();
                if !targets.contains(&target) {
                    targets.push(target);
                }
                Value::References(targets)
            }
            (FieldKind::References { .. }, _) => Value::References(vec![target]),
            (FieldKind::Reference { .. }, _) => Value::Reference(target),
            (kind, _) => {
                return Err(DbError::TypeMismatch(format!(
                    "Field '{}' is {}, not a reference",
                    def.name, kind
                )));
            }
        };
        def.validate(&next)?;
        obj.set(field, next);
        Ok(())
    }

    pub async fn remove_reference(&self, invid: Invid, field: FieldId, target: Invid) -> Result<()> {
        let server = self.enter()?;
        let schema = server.store.schema(invid.base)?;
        let def = schema.require_field(field)?;
        if !def.kind.is_reference() {
            return Err(DbError::TypeMismatch(format!("Field '{}' is not a reference", def.name)));
        }

        let mut txn = self.inner.txn.lock().await;
        let edits = txn.as_mut().ok_or(DbError::NoTransaction)?;
        let obj = self.working(&server, edits, invid).await?;
        match obj.get(field).cloned() {
            Some(Value::Reference(current)) if current == target => {
                obj.clear(field);
            }
            Some(Value::References(mut targets)) => {
                targets.retain(|t| *t != target);
                if targets.is_empty() {
                    obj.clear(field);
                } else {
                    obj.set(field, Value::References(targets));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn delete_object(&self, invid: Invid) -> Result<()> {
        let server = self.enter()?;
        let mut txn = self.inner.txn.lock().await;
        let edits = txn.as_mut().ok_or(DbError::NoTransaction)?;
        let original = match edits.view(invid) {
            Some(_) => None,
            None => Some(self.check_out(&server, edits, invid).await?),
        };
        edits.delete(invid, original)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The object as this session sees it: its own pending state if the open
    /// transaction touched it, the committed state otherwise.
    pub async fn view_object(&self, invid: Invid) -> Result<DbObject> {
        let server = self.enter()?;
        let txn = self.inner.txn.lock().await;
        if let Some(pending) = txn.as_ref().and_then(|e| e.view(invid)) {
            return pending.cloned().ok_or(DbError::ObjectNotFound(invid));
        }
        drop(txn);
        self.committed(&server, invid).await
    }

    /// Objects in `base` matching `predicate`, overlaid with this session's
    /// pending changes.
    pub async fn query<F>(&self, base: BaseId, mut predicate: F) -> Result<Vec<DbObject>>
    where
        F: FnMut(&DbObject) -> bool,
    {
        let server = self.enter()?;
        let txn = self.inner.txn.lock().await;
        let committed = {
            let _guard = self.read_lock(&server, [base]).await?;
            server.store.objects_in(base)?
        };

        let Some(edits) = txn.as_ref() else {
            return Ok(committed.into_iter().filter(|o| predicate(o)).collect());
        };
        let mut results: Vec<DbObject> = committed
            .into_iter()
            .filter(|o| edits.view(o.invid()).is_none())
            .collect();
        results.extend(
            edits
                .changes()
                .filter(|c| c.base() == base)
                .filter_map(|c| c.current().cloned()),
        );
        results.retain(|o| predicate(o));
        results.sort_by_key(|o| o.invid());
        Ok(results)
    }

    pub async fn find_by_label(&self, base: BaseId, label: &str) -> Result<Vec<DbObject>> {
        let schema = self.enter()?.store.schema(base)?;
        let Some(label_field) = schema.label_field() else {
            return Ok(Vec::new());
        };
        self.query(base, |o| {
            o.get(label_field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.eq_ignore_ascii_case(label))
        })
        .await
    }

    // ------------------------------------------------------------------
    // Checkpoints and rollback
    // ------------------------------------------------------------------

    pub async fn checkpoint(&self, label: &str) -> Result<()> {
        self.enter()?;
        let mut txn = self.inner.txn.lock().await;
        txn.as_mut().ok_or(DbError::NoTransaction)?.checkpoint(label)
    }

    pub async fn pop_checkpoint(&self, label: &str) -> Result<()> {
        self.enter()?;
        let mut txn = self.inner.txn.lock().await;
        txn.as_mut().ok_or(DbError::NoTransaction)?.pop_checkpoint(label)
    }

    /// Undo to the named checkpoint, or discard the whole transaction when
    /// `label` is `None`. A no-op without an open transaction.
    pub async fn rollback(&self, label: Option<&str>) -> Result<()> {
        let server = self.enter()?;
        let mut txn = self.inner.txn.lock().await;
        match (txn.as_mut(), label) {
            (None, _) => Ok(()),
            (Some(edits), Some(label)) => {
                edits.rollback_to(label)?;
                let checked_out = |invid: Invid| edits.change(invid).is_some_and(|c| c.original().is_some());
                server.checkouts.release_unless(edits.id(), checked_out);
                Ok(())
            }
            (Some(edits), None) => {
                edits.abort();
                server.checkouts.release_all(edits.id());
                debug!(session = self.name(), id = %edits.id(), "transaction rolled back");
                *txn = None;
                Ok(())
            }
        }
    }

    /// Validate and install the open transaction.
    ///
    /// The transaction is closed either way: on any failure every pending
    /// change is discarded and the store is left exactly as it was. Returns
    /// the number of objects written.
    pub async fn commit_transaction(&self) -> Result<usize> {
        let server = self.enter()?;
        let mut txn = self.inner.txn.lock().await;
        let mut edits = txn.take().ok_or(DbError::NoTransaction)?;
        drop(txn);

        let result = self.commit(&server, &mut edits).await;
        if result.is_err() {
            edits.abort();
        }
        server.checkouts.release_all(edits.id());
        result
    }

    async fn commit(&self, server: &Shared, edits: &mut EditSet) -> Result<usize> {
        // forced off while the lock request was being registered
        server
            .commit_edits(self.name(), edits, || match self.closed_reason() {
                Some(reason) => Err(DbError::SessionClosed(reason)),
                None => Ok(()),
            })
            .await
    }

    pub async fn has_transaction(&self) -> bool {
        self.inner.txn.lock().await.is_some()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Roll back any open transaction and leave. Logging out twice is a no-op.
    pub async fn logout(&self) -> Result<()> {
        if !self.mark_closed("logged out") {
            return Ok(());
        }
        self.discard_transaction().await;
        if let Some(server) = self.inner.server.upgrade() {
            server.release_session(self, LogoutKind::Normal, "logged out");
        }
        Ok(())
    }

    /// Force the session off: pending lock waits are cancelled, the open
    /// transaction is rolled back and the session is deregistered.
    pub async fn force_off(&self, reason: &str) {
        if !self.mark_closed(reason) {
            return;
        }
        let server = self.inner.server.upgrade();
        if let Some(server) = &server {
            server.locks.abort_owner(self.name());
        }
        {
            let mut state = self.state();
            state.messages.push_back(ClientMessage::ForcedOff {
                reason: reason.to_string(),
            });
        }
        self.discard_transaction().await;
        warn!(session = self.name(), reason, "session forced off");
        if let Some(server) = server {
            server.release_session(self, LogoutKind::Forced, reason);
        }
    }

    async fn discard_transaction(&self) {
        let mut txn = self.inner.txn.lock().await;
        if let Some(mut edits) = txn.take() {
            edits.abort();
            if let Some(server) = self.inner.server.upgrade() {
                server.checkouts.release_all(edits.id());
            }
            debug!(session = self.name(), id = %edits.id(), "open transaction discarded");
        }
    }

    /// Force the session off if it has been idle too long. A session with
    /// checked-out objects gets the longer limit. Returns true if forced off.
    pub async fn time_check(&self) -> bool {
        let Some(server) = self.inner.server.upgrade() else {
            return false;
        };
        if self.is_closed() {
            return false;
        }
        // an operation in flight holds the transaction, so the session is not idle
        let Ok(txn) = self.inner.txn.try_lock() else {
            return false;
        };
        let checked_out = txn.as_ref().map_or(0, |e| e.checked_out_count());
        drop(txn);

        let limit = if checked_out > 0 {
            server.config.idle_timeout_with_objects
        } else {
            server.config.idle_timeout
        };
        let idle = server.clock.now() - self.last_activity();
        let over = idle.to_std().is_ok_and(|idle| idle > limit);
        if over {
            let minutes = limit.as_secs() / 60;
            self.force_off(&format!("idle timeout ({} minutes)", minutes)).await;
        }
        over
    }

    pub async fn summary(&self) -> SessionSummary {
        let (transaction, pending_changes, checked_out) = match self.inner.txn.try_lock() {
            Ok(txn) => match txn.as_ref() {
                Some(edits) => (
                    Some(edits.description().to_string()),
                    edits.len(),
                    edits.checked_out_count(),
                ),
                None => (None, 0, 0),
            },
            Err(_) => (Some("(busy)".to_string()), 0, 0),
        };
        SessionSummary {
            id: self.inner.id,
            name: self.inner.name.clone(),
            host: self.inner.host.clone(),
            logged_in_at: self.inner.logged_in_at,
            last_activity: self.last_activity(),
            transaction,
            pending_changes,
            checked_out,
        }
    }
}

/// Run a read-only closure against the store under a read lock, with an
/// internal owner name rather than a session.
pub(crate) async fn with_read_lock<T>(
    server: &Shared,
    owner: &str,
    bases: impl IntoIterator<Item = BaseId>,
    f: impl FnOnce(&ObjectStore) -> Result<T>,
) -> Result<T> {
    let _guard = server
        .locks
        .acquire(owner, LockKind::Read, LockScope::bases(bases), server.config.lock_timeout)
        .await?
        .into_result()?;
    f(&server.store)
}
