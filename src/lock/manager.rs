use super::{LockInfo, LockKind, LockResult, LockScope};
use crate::core::{BaseId, DbError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct BaseLocks {
    readers: HashSet<u64>,
    writer_queue: VecDeque<u64>,
    writer: Option<u64>,
    dumper_queue: VecDeque<u64>,
    dumper: Option<u64>,
}

impl BaseLocks {
    fn is_idle(&self) -> bool {
        self.readers.is_empty()
            && self.writer_queue.is_empty()
            && self.writer.is_none()
            && self.dumper_queue.is_empty()
            && self.dumper.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    /// Write requests sit here until no dump is queued on their bases, then
    /// enter the write queues in request order.
    Waiting,
    Queued,
    Granted,
}

#[derive(Debug)]
struct Request {
    owner: String,
    kind: LockKind,
    bases: Vec<BaseId>,
    state: RequestState,
    aborted: bool,
    requested_at: DateTime<Utc>,
}

enum Grant {
    Granted,
    Aborted,
    Pending,
}

#[derive(Debug, Default)]
struct LockTable {
    bases: HashMap<BaseId, BaseLocks>,
    known: BTreeSet<BaseId>,
    requests: HashMap<u64, Request>,
    next_id: u64,
    closed: bool,
}

impl LockTable {
    fn resolve(&mut self, scope: LockScope) -> Vec<BaseId> {
        let bases = match scope {
            LockScope::All => self.known.iter().copied().collect(),
            LockScope::Bases(bases) => bases,
        };
        self.known.extend(bases.iter().copied());
        bases
    }

    fn base(&mut self, base: BaseId) -> &mut BaseLocks {
        self.bases.entry(base).or_default()
    }

    fn held_count(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.state == RequestState::Granted)
            .count()
    }

    fn check_owner(&self, owner: &str, kind: LockKind) -> Result<()> {
        for req in self.requests.values().filter(|r| r.owner == owner) {
            if req.kind.is_exclusive() || kind.is_exclusive() {
                return Err(DbError::LockMisuse(format!(
                    "{} already holds or awaits a {} lock, cannot request a {} lock",
                    owner, req.kind, kind
                )));
            }
        }
        Ok(())
    }

    fn register(&mut self, owner: &str, kind: LockKind, bases: Vec<BaseId>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        if kind == LockKind::Dump {
            for b in &bases {
                self.base(*b).dumper_queue.push_back(id);
            }
        }
        self.requests.insert(
            id,
            Request {
                owner: owner.to_string(),
                kind,
                bases,
                state: RequestState::Waiting,
                aborted: false,
                requested_at: Utc::now(),
            },
        );
        if kind == LockKind::Write {
            self.promote_waiting_writers();
        }
        id
    }

    /// Move waiting writers whose bases have no dump queued or held into
    /// their write queues, oldest request first, so writers held back by a
    /// dump keep their arrival order.
    fn promote_waiting_writers(&mut self) {
        let mut waiting: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, r)| r.kind == LockKind::Write && r.state == RequestState::Waiting && !r.aborted)
            .map(|(id, _)| *id)
            .collect();
        waiting.sort_unstable();
        for id in waiting {
            let bases = self.request(id).bases.clone();
            let no_dumpers = bases.iter().all(|b| {
                self.bases
                    .get(b)
                    .is_none_or(|locks| locks.dumper_queue.is_empty() && locks.dumper.is_none())
            });
            if !no_dumpers {
                continue;
            }
            for b in &bases {
                self.base(*b).writer_queue.push_back(id);
            }
            if let Some(req) = self.requests.get_mut(&id) {
                req.state = RequestState::Queued;
            }
        }
    }

    fn request(&self, id: u64) -> &Request {
        match self.requests.get(&id) {
            Some(req) => req,
            None => panic!("lock table inconsistency: request {} missing", id),
        }
    }

    fn try_grant(&mut self, id: u64) -> Grant {
        let req = self.request(id);
        if req.aborted {
            return Grant::Aborted;
        }
        let (kind, bases, mut state) = (req.kind, req.bases.clone(), req.state);

        let granted = match kind {
            LockKind::Read => {
                let free = bases.iter().all(|b| {
                    let locks = self.base(*b);
                    locks.writer_queue.is_empty() && locks.writer.is_none()
                });
                if free {
                    for b in &bases {
                        self.base(*b).readers.insert(id);
                    }
                }
                free
            }
            LockKind::Write => {
                if state == RequestState::Waiting {
                    self.promote_waiting_writers();
                    state = self.request(id).state;
                }
                let free = state == RequestState::Queued
                    && bases.iter().all(|b| {
                        let locks = self.base(*b);
                        locks.writer_queue.front() == Some(&id)
                            && locks.readers.is_empty()
                            && locks.writer.is_none()
                            && locks.dumper.is_none()
                    });
                if free {
                    for b in &bases {
                        let locks = self.base(*b);
                        locks.writer_queue.pop_front();
                        locks.writer = Some(id);
                    }
                }
                free
            }
            LockKind::Dump => {
                let free = bases.iter().all(|b| {
                    let locks = self.base(*b);
                    locks.writer_queue.is_empty()
                        && locks.writer.is_none()
                        && locks.dumper.is_none()
                        && locks.dumper_queue.front() == Some(&id)
                });
                if free {
                    for b in &bases {
                        let locks = self.base(*b);
                        locks.dumper_queue.pop_front();
                        locks.dumper = Some(id);
                    }
                }
                free
            }
        };

        if let Some(req) = self.requests.get_mut(&id) {
            req.state = if granted { RequestState::Granted } else { state };
        }
        if granted { Grant::Granted } else { Grant::Pending }
    }

    /// Drop a request from every structure it appears in, granted or not.
    fn remove(&mut self, id: u64) -> Option<Request> {
        let req = self.requests.remove(&id)?;
        let granted = req.state == RequestState::Granted;
        for b in &req.bases {
            let locks = self.base(*b);
            match req.kind {
                LockKind::Read => {
                    if !locks.readers.remove(&id) && granted {
                        panic!("lock table inconsistency: reader {} not recorded on base {}", id, b);
                    }
                }
                LockKind::Write => {
                    if granted {
                        if locks.writer != Some(id) {
                            panic!("lock table inconsistency: writer {} not active on base {}", id, b);
                        }
                        locks.writer = None;
                    } else {
                        locks.writer_queue.retain(|q| *q != id);
                    }
                }
                LockKind::Dump => {
                    if granted {
                        if locks.dumper != Some(id) {
                            panic!("lock table inconsistency: dumper {} not active on base {}", id, b);
                        }
                        locks.dumper = None;
                    } else {
                        locks.dumper_queue.retain(|q| *q != id);
                    }
                }
            }
            if locks.is_idle() {
                self.bases.remove(b);
            }
        }
        if req.kind == LockKind::Dump {
            self.promote_waiting_writers();
        }
        Some(req)
    }
}

struct Shared {
    table: Mutex<LockTable>,
    notify: Notify,
    held: watch::Sender<usize>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, LockTable> {
        // Table updates never panic half-way except on the inconsistency
        // panics above, after which the process is already broken.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, id: u64) {
        let held = {
            let mut table = self.table();
            table.remove(id);
            table.held_count()
        };
        self.held.send_replace(held);
        self.notify.notify_waiters();
    }
}

/// Withdraws a request whose waiting future is dropped before grant.
struct PendingRequest<'a> {
    shared: &'a Arc<Shared>,
    id: u64,
    armed: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release(self.id);
        }
    }
}

/// Shared handle to the lock table. Clones refer to the same table.
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<Shared>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

impl LockManager {
    pub fn new(bases: impl IntoIterator<Item = BaseId>) -> Self {
        let table = LockTable {
            known: bases.into_iter().collect(),
            ..Default::default()
        };
        let (held, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(table),
                notify: Notify::new(),
                held,
            }),
        }
    }

    /// Make `base` part of what [`LockScope::All`] covers for later requests.
    pub fn add_base(&self, base: BaseId) {
        self.shared.table().known.insert(base);
    }

    pub async fn read(&self, owner: &str, scope: LockScope) -> Result<LockResult> {
        self.acquire(owner, LockKind::Read, scope, None).await
    }

    pub async fn write(&self, owner: &str, scope: LockScope) -> Result<LockResult> {
        self.acquire(owner, LockKind::Write, scope, None).await
    }

    pub async fn dump(&self, owner: &str, scope: LockScope) -> Result<LockResult> {
        self.acquire(owner, LockKind::Dump, scope, None).await
    }

    /// Request a lock and wait until it is granted, cancelled or `timeout`
    /// elapses. Fails with [`DbError::LockMisuse`] when `owner` already holds
    /// or awaits an exclusive lock, or asks for an exclusive lock while
    /// holding any other.
    pub async fn acquire(
        &self,
        owner: &str,
        kind: LockKind,
        scope: LockScope,
        timeout: Option<Duration>,
    ) -> Result<LockResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let id = {
            let mut table = self.shared.table();
            if table.closed {
                return Ok(LockResult::Cancelled);
            }
            table.check_owner(owner, kind)?;
            let bases = table.resolve(scope);
            table.register(owner, kind, bases)
        };
        let mut pending = PendingRequest {
            shared: &self.shared,
            id,
            armed: true,
        };
        debug!(owner, %kind, id, "lock requested");

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (grant, held) = {
                let mut table = self.shared.table();
                let grant = table.try_grant(id);
                (grant, table.held_count())
            };
            match grant {
                Grant::Granted => {
                    pending.armed = false;
                    self.shared.held.send_replace(held);
                    debug!(owner, %kind, id, "lock granted");
                    return Ok(LockResult::Granted(LockGuard {
                        shared: Some(self.shared.clone()),
                        id,
                        kind,
                    }));
                }
                Grant::Aborted => {
                    debug!(owner, %kind, id, "lock request cancelled");
                    return Ok(LockResult::Cancelled);
                }
                Grant::Pending => {}
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut()).await.is_err() {
                        warn!(owner, %kind, id, "lock request timed out");
                        return Ok(LockResult::TimedOut);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Cancel every pending request made by `owner`. Locks already granted
    /// stay held until their guards are released.
    pub fn abort_owner(&self, owner: &str) -> usize {
        let aborted = {
            let mut table = self.shared.table();
            let mut count = 0;
            for req in table.requests.values_mut() {
                if req.owner == owner && req.state != RequestState::Granted && !req.aborted {
                    req.aborted = true;
                    count += 1;
                }
            }
            count
        };
        if aborted > 0 {
            debug!(owner, aborted, "pending lock requests aborted");
            self.shared.notify.notify_waiters();
        }
        aborted
    }

    /// Cancel everything pending and refuse further requests.
    pub fn close(&self) {
        {
            let mut table = self.shared.table();
            table.closed = true;
            for req in table.requests.values_mut() {
                if req.state != RequestState::Granted {
                    req.aborted = true;
                }
            }
        }
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.table().closed
    }

    pub fn held_count(&self) -> usize {
        self.shared.table().held_count()
    }

    /// Receiver tracking the number of granted locks.
    pub fn subscribe_held(&self) -> watch::Receiver<usize> {
        self.shared.held.subscribe()
    }

    pub fn locks(&self) -> Vec<LockInfo> {
        let table = self.shared.table();
        let mut infos: Vec<LockInfo> = table
            .requests
            .iter()
            .map(|(id, r)| LockInfo {
                id: *id,
                owner: r.owner.clone(),
                kind: r.kind,
                bases: r.bases.clone(),
                granted: r.state == RequestState::Granted,
                requested_at: r.requested_at,
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}

/// A granted lock. Released on [`LockGuard::release`] or on drop.
#[derive(Debug)]
pub struct LockGuard {
    shared: Option<Arc<Shared>>,
    id: u64,
    kind: LockKind,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn is_held(&self) -> bool {
        self.shared.is_some()
    }

    /// Idempotent.
    pub fn release(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.id);
            debug!(id = self.id, kind = %self.kind, "lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
