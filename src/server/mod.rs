// ============================================================================
// Server
// ============================================================================
//
// One Server per process owns the object store, the lock manager, both
// admission gates (logins and builder phase 2), the session registry, the
// audit log and the scheduler. Sessions and builder tasks hold weak handles
// back to it.
//
// Login order: admission permit -> read lock on the account bases ->
// credential check -> unique session name -> register. Any failure after
// the permit returns it.
//
// ============================================================================

pub mod admin;
pub mod builder;
pub mod maintenance;
pub mod registry;
pub mod shutdown;

pub use admin::{AdminEvent, AdminSession};
pub use builder::{BuildView, Builder, BuilderTask, FORCE_BUILD};
pub use maintenance::InvidReport;
pub use registry::SessionRegistry;
pub use shutdown::{SHUTDOWN_REASON, ServerState};

use crate::audit::{AuditEvent, AuditKind, AuditLog};
use crate::core::{BaseId, BaseSchema, Clock, DbError, DbObject, Invid, Result, SystemClock, Value};
use crate::lock::{LockKind, LockManager, LockScope};
use crate::scheduler::{Scheduler, TaskEvent, task_fn};
use crate::session::auth::{authenticate, hash_password, hash_password_blocking};
use crate::session::{
    AdminPrivilege, AdmissionSemaphore, ClientMessage, Identity, LogoutKind, ServerConfig, Session,
    SessionSummary, with_read_lock,
};
use crate::storage::{
    Catalog, DumpManager, ObjectStore, PERSONA_BASE, SUPERGASH, SUPERGASH_LABEL, USER_BASE,
    persona_fields, user_fields,
};
use crate::transaction::{
    CheckoutTable, CommitHook, CommitView, EditSet, commit_scope, ensure_current, run_hooks, validate,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Claimed by [`Server::start`]; at most one started server per process.
static SERVER_SLOT: AtomicBool = AtomicBool::new(false);

static NEXT_INTERNAL_OWNER: AtomicU64 = AtomicU64::new(1);

pub const IDLE_TASK: &str = "idle timer";
pub const DUMP_TASK: &str = "database dumper";

/// Lock owner name for one internal operation. Every call gets its own name
/// so overlapping operations never look like one owner asking twice.
pub(crate) fn internal_owner(what: &str) -> String {
    format!("<{} {}>", what, NEXT_INTERNAL_OWNER.fetch_add(1, Ordering::Relaxed))
}

pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: ObjectStore,
    pub(crate) locks: LockManager,
    pub(crate) login_gate: AdmissionSemaphore,
    pub(crate) build_gate: AdmissionSemaphore,
    pub(crate) registry: SessionRegistry,
    pub(crate) audit: AuditLog,
    pub(crate) scheduler: Scheduler,
    pub(crate) dumper: DumpManager,
    pub(crate) checkouts: CheckoutTable,
    pub(crate) state: watch::Sender<ServerState>,
    pub(crate) weak_self: Weak<Shared>,
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
    builders: Mutex<Vec<String>>,
    events: broadcast::Sender<AdminEvent>,
    shutdown_reason: Mutex<Option<String>>,
    maintenance: Mutex<Option<&'static str>>,
    holds_slot: AtomicBool,
}

impl Shared {
    pub(crate) fn shutdown_reason(&self) -> MutexGuard<'_, Option<String>> {
        self.shutdown_reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn maintenance(&self) -> MutexGuard<'_, Option<&'static str>> {
        self.maintenance.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn emit(&self, event: AdminEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn commit_hooks(&self) -> Vec<Arc<dyn CommitHook>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn builder_names(&self) -> Vec<String> {
        self.builders.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn release_slot(&self) {
        if self.holds_slot.swap(false, Ordering::SeqCst) {
            SERVER_SLOT.store(false, Ordering::SeqCst);
        }
    }

    fn admission_error(&self, reason: &str) -> DbError {
        if reason != SHUTDOWN_REASON {
            return DbError::AdmissionDenied(format!("semaphore disabled: {}", reason));
        }
        let notice = "The server is waiting to shut down. No logins will be accepted until it has restarted.";
        match self.shutdown_reason().clone() {
            Some(why) => DbError::AdmissionDenied(format!("{}\n\nReason for shutdown: {}", notice, why)),
            None => DbError::AdmissionDenied(notice.to_string()),
        }
    }

    /// Deregister a closing session and return its admission permit.
    pub(crate) fn release_session(&self, session: &Session, kind: LogoutKind, reason: &str) {
        let Some(remaining) = self.registry.remove(session, self.clock.now()) else {
            return;
        };
        self.login_gate.decrement();

        let (audit_kind, message) = match kind {
            LogoutKind::Normal => (
                AuditKind::NormalLogout,
                format!("OK logout for username: {}", session.name()),
            ),
            LogoutKind::Forced => (
                AuditKind::AbnormalLogout,
                format!("Abnormal logout for username: {}: {}", session.name(), reason),
            ),
        };
        self.audit
            .record(AuditEvent::new(self.clock.now(), audit_kind, message).actor(session.name()));

        for other in self.registry.snapshot() {
            other.push_message(ClientMessage::Logout {
                name: session.name().to_string(),
                count: remaining,
            });
        }
        self.emit(AdminEvent::SessionClosed {
            name: session.name().to_string(),
            reason: reason.to_string(),
            forced: kind == LogoutKind::Forced,
        });
        info!(session = session.name(), remaining, reason, "session closed");
        self.maybe_finish_deferred_shutdown();
    }

    /// Validate and install `edits` under a write lock over their commit
    /// scope. `still_open` runs once the lock is held and may veto the
    /// commit (a session forced off while waiting).
    pub(crate) async fn commit_edits<F>(&self, owner: &str, edits: &mut EditSet, still_open: F) -> Result<usize>
    where
        F: Fn() -> Result<()> + Send + Sync,
    {
        if edits.is_empty() {
            edits.take_batch()?;
            return Ok(0);
        }

        let scope = commit_scope(&self.store, edits)?;
        let _guard = self
            .locks
            .acquire(owner, LockKind::Write, LockScope::bases(scope), self.config.lock_timeout)
            .await?
            .into_result()?;
        still_open()?;
        ensure_current(&self.store, edits)?;

        {
            let view = CommitView::new(&self.store, edits);
            validate(&view)?;
            let hooks = self.commit_hooks();
            run_hooks(&view, &hooks).await?;
        }

        let id = edits.id();
        let batch = edits.take_batch()?;
        let invids: Vec<Invid> = batch.iter().map(|(i, _)| *i).collect();
        let count = invids.len();
        self.store.apply(batch, self.clock.now())?;

        info!(owner, %id, objects = count, "transaction committed");
        self.audit.record(
            AuditEvent::new(
                self.clock.now(),
                AuditKind::Commit,
                format!("{} committed {} object(s)", owner, count),
            )
            .actor(owner)
            .objects(invids),
        );
        self.demand_builders();
        Ok(count)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.release_slot();
    }
}

/// Admission permit taken by a login in progress; returned unless the
/// login completes.
struct LoginPermit<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for LoginPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.login_gate.decrement();
            self.shared.maybe_finish_deferred_shutdown();
        }
    }
}

/// Handle to the running server. Clones refer to the same server.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("sessions", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Start the process-wide server. Fails with
    /// [`DbError::ServerAlreadyRunning`] while another started server lives.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        if SERVER_SLOT
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbError::ServerAlreadyRunning);
        }
        match Self::build(config, Arc::new(SystemClock), true).await {
            Ok(server) => Ok(server),
            Err(e) => {
                SERVER_SLOT.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// A server that does not claim the process slot, for tests and
    /// embedding several instances.
    pub async fn isolated(config: ServerConfig) -> Result<Self> {
        Self::build(config, Arc::new(SystemClock), false).await
    }

    pub async fn isolated_with_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::build(config, clock, false).await
    }

    async fn build(config: ServerConfig, clock: Arc<dyn Clock>, holds_slot: bool) -> Result<Self> {
        config.validate().map_err(DbError::ConfigError)?;

        let dumper = DumpManager::new(&config.dump_path).with_archive(config.archive_dumps);
        let loaded = if config.load_on_start { dumper.load()? } else { None };
        let store = match loaded {
            Some(image) => {
                info!(path = %dumper.path().display(), objects = image.objects.len(), "loaded database");
                ObjectStore::from_image(image)
            }
            None => ObjectStore::new(Catalog::with_builtins()),
        };
        let locks = LockManager::new(store.base_ids()?);
        let audit = match &config.audit_log_path {
            Some(path) => AuditLog::open(path)?,
            None => AuditLog::in_memory(),
        };
        let scheduler = Scheduler::new(Arc::clone(&clock));
        let (state, _) = watch::channel(ServerState::Running);
        let (events, _) = broadcast::channel(256);

        let shared = Arc::new_cyclic(|weak_self| Shared {
            config,
            clock,
            store,
            locks,
            login_gate: AdmissionSemaphore::new(),
            build_gate: AdmissionSemaphore::new(),
            registry: SessionRegistry::new(),
            audit,
            scheduler,
            dumper,
            checkouts: CheckoutTable::new(),
            state,
            weak_self: weak_self.clone(),
            hooks: RwLock::new(Vec::new()),
            builders: Mutex::new(Vec::new()),
            events,
            shutdown_reason: Mutex::new(None),
            maintenance: Mutex::new(None),
            holds_slot: AtomicBool::new(holds_slot),
        });
        let server = Self { shared };
        server.ensure_root_persona()?;
        server.forward_events();
        info!("server ready");
        Ok(server)
    }

    /// Create the root persona if the store does not have one.
    fn ensure_root_persona(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.store.contains(SUPERGASH)? {
            return Ok(());
        }
        let mut root = DbObject::new(SUPERGASH);
        root.set(persona_fields::LABEL, SUPERGASH_LABEL.into());
        root.set(persona_fields::NAME, SUPERGASH_LABEL.into());
        root.set(
            persona_fields::PASSWORD,
            Value::Password(hash_password(&shared.config.root_password, shared.config.bcrypt_cost)?),
        );
        for flag in [
            persona_fields::ADMIN_CONSOLE,
            persona_fields::ADMIN_POWER,
            persona_fields::INTERPRETER_POWER,
        ] {
            root.set(flag, true.into());
        }
        shared.store.apply(vec![(SUPERGASH, Some(root))], shared.clock.now())?;
        info!("created root persona");
        Ok(())
    }

    /// Relay scheduler and lock table changes to admin consoles.
    fn forward_events(&self) {
        let mut tasks = self.shared.scheduler.subscribe();
        let events = self.shared.events.clone();
        tokio::spawn(async move {
            loop {
                match tasks.recv().await {
                    Ok(TaskEvent::TableChanged | TaskEvent::Started { .. } | TaskEvent::Completed { .. }) => {
                        let _ = events.send(AdminEvent::TasksChanged);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut held = self.shared.locks.subscribe_held();
        let events = self.shared.events.clone();
        tokio::spawn(async move {
            while held.changed().await.is_ok() {
                let count = *held.borrow_and_update();
                let _ = events.send(AdminEvent::LocksHeld(count));
            }
        });
    }

    /// Register the idle sweep and periodic dump tasks and start the
    /// scheduler loop.
    pub fn start_background_tasks(&self) -> Result<JoinHandle<()>> {
        let shared = &self.shared;
        let now = shared.clock.now();
        let sweep = shared.config.idle_sweep_interval;
        let weak = Arc::downgrade(shared);
        shared.scheduler.add_periodic(
            IDLE_TASK,
            now + chrono::Duration::from_std(sweep).map_err(|e| DbError::ConfigError(e.to_string()))?,
            sweep,
            task_fn(move |_| {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        let cleared = Server { shared }.clear_idle_sessions().await;
                        if cleared > 0 {
                            info!(cleared, "idle sessions forced off");
                        }
                    }
                    Ok(())
                }
            }),
        )?;

        if let Some(every) = shared.config.dump_interval {
            let weak = Arc::downgrade(shared);
            shared.scheduler.add_periodic(
                DUMP_TASK,
                now + chrono::Duration::from_std(every).map_err(|e| DbError::ConfigError(e.to_string()))?,
                every,
                task_fn(move |_| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(shared) => Server { shared }
                                .dump()
                                .await
                                .map(|_| ())
                                .map_err(anyhow::Error::from),
                            None => Ok(()),
                        }
                    }
                }),
            )?;
        }
        Ok(shared.scheduler.start())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.shared.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.shared.locks
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn audit(&self) -> &AuditLog {
        &self.shared.audit
    }

    pub fn login_semaphore(&self) -> &AdmissionSemaphore {
        &self.shared.login_gate
    }

    pub fn build_semaphore(&self) -> &AdmissionSemaphore {
        &self.shared.build_gate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdminEvent> {
        self.shared.events.subscribe()
    }

    pub fn session(&self, name: &str) -> Option<Session> {
        self.shared.registry.get(name)
    }

    pub fn session_names(&self) -> Vec<String> {
        self.shared.registry.names()
    }

    pub fn last_logout(&self, user: Invid) -> Option<chrono::DateTime<chrono::Utc>> {
        self.shared.registry.last_logout(user)
    }

    pub fn add_commit_hook(&self, hook: Arc<dyn CommitHook>) {
        debug!(hook = hook.name(), "commit hook added");
        self.shared
            .hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Add an object base to the store and the lock table.
    pub fn add_base(&self, schema: BaseSchema) -> Result<()> {
        let id = schema.id;
        self.shared.store.add_base(schema)?;
        self.shared.locks.add_base(id);
        Ok(())
    }

    /// Register `builder` as an on-demand task named `name`. It runs after
    /// every successful commit and whenever demanded.
    pub fn register_builder<B: Builder>(&self, name: &str, builder: B) -> Arc<BuilderTask<B>> {
        let task = Arc::new(BuilderTask::new(name, builder, Arc::downgrade(&self.shared)));
        self.shared.scheduler.add_on_demand(name, task.clone());
        let mut builders = self.shared.builders.lock().unwrap_or_else(|e| e.into_inner());
        if !builders.iter().any(|b| b == name) {
            builders.push(name.to_string());
        }
        task
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    /// bcrypt verification runs on the blocking pool while the read lock on
    /// the account bases is held.
    async fn check_credentials(&self, owner: &str, name: &str, password: &str) -> Result<Option<Identity>> {
        let shared = &self.shared;
        let guard = shared
            .locks
            .acquire(
                owner,
                LockKind::Read,
                LockScope::bases([PERSONA_BASE, USER_BASE]),
                shared.config.lock_timeout,
            )
            .await?
            .into_result()?;
        let (store_owner, name, password) = (Arc::clone(shared), name.to_string(), password.to_string());
        let identity = tokio::task::spawn_blocking(move || authenticate(&store_owner.store, &name, &password))
            .await
            .map_err(|e| DbError::Fatal(format!("Credential check task failed: {}", e)))?;
        drop(guard);
        identity
    }

    fn report_failed_login(&self, name: &str, host: &str) -> DbError {
        warn!(username = name, host, "bad login attempt");
        self.shared.audit.record(
            AuditEvent::new(
                self.shared.clock.now(),
                AuditKind::BadPass,
                format!("Bad login attempt for username: {} from host {}", name, host),
            )
            .actor(name),
        );
        DbError::AuthenticationFailed
    }

    /// Log in as a user or persona. Names match case-insensitively.
    pub async fn login(&self, name: &str, password: &str, host: &str) -> Result<Session> {
        let shared = &self.shared;
        shared
            .login_gate
            .increment(shared.config.login_wait)
            .await
            .map_err(|reason| shared.admission_error(&reason))?;
        let mut permit = LoginPermit { shared, armed: true };

        let owner = internal_owner(&format!("login {}", name));
        let Some(identity) = self.check_credentials(&owner, name, password).await? else {
            return Err(self.report_failed_login(name, host));
        };

        let now = shared.clock.now();
        let label = identity.label.clone();
        let objects: Vec<Invid> = identity.persona.into_iter().chain(identity.user).collect();
        let session = shared.registry.register_with(&label, |unique| {
            Session::new(unique, identity, host.to_string(), now, shared)
        });
        permit.armed = false;

        info!(session = session.name(), host, "logged in");
        shared.audit.record(
            AuditEvent::new(
                now,
                AuditKind::NormalLogin,
                format!("OK login for username: {} from host {}", session.name(), host),
            )
            .actor(session.name())
            .objects(objects),
        );
        let count = shared.registry.len();
        for other in shared.registry.snapshot() {
            if !other.same(&session) {
                other.push_message(ClientMessage::Login {
                    name: session.name().to_string(),
                    count,
                });
            }
        }
        shared.emit(AdminEvent::SessionOpened {
            name: session.name().to_string(),
            host: host.to_string(),
        });
        Ok(session)
    }

    /// Attach an admin console. Only personas with console privileges may
    /// attach, and never while logins are disabled.
    pub async fn admin(&self, name: &str, password: &str) -> Result<AdminSession> {
        let shared = &self.shared;
        if let Some(reason) = shared.login_gate.check_enabled() {
            return Err(shared.admission_error(&reason));
        }
        let owner = internal_owner(&format!("admin {}", name));
        let identity = match self.check_credentials(&owner, name, password).await? {
            Some(identity) if identity.privilege.can_view() => identity,
            _ => return Err(self.report_failed_login(name, "admin console")),
        };

        info!(admin = %identity.label, privilege = %identity.privilege, "admin console attached");
        shared.audit.record(
            AuditEvent::new(
                shared.clock.now(),
                AuditKind::AdminConnect,
                format!("Admin console attached for {}", identity.label),
            )
            .actor(identity.label.clone()),
        );
        Ok(AdminSession::new(identity.label, identity.privilege, self.clone()))
    }

    // ------------------------------------------------------------------
    // Session control
    // ------------------------------------------------------------------

    /// Force off the session registered as `name`, ignoring case.
    pub async fn kill_user(&self, name: &str, reason: &str) -> bool {
        match self.shared.registry.get(name) {
            Some(session) => {
                session.force_off(reason).await;
                true
            }
            None => false,
        }
    }

    pub async fn kill_all_users(&self, reason: &str) -> usize {
        let sessions = self.shared.registry.snapshot();
        let count = sessions.len();
        for session in sessions {
            session.force_off(reason).await;
        }
        count
    }

    /// Run the idle check on every live session. Returns how many were
    /// forced off.
    pub async fn clear_idle_sessions(&self) -> usize {
        let mut cleared = 0;
        for session in self.shared.registry.snapshot() {
            if session.time_check().await {
                cleared += 1;
            }
        }
        cleared
    }

    pub async fn user_table(&self) -> Vec<SessionSummary> {
        let mut table = Vec::new();
        for session in self.shared.registry.snapshot() {
            table.push(session.summary().await);
        }
        table
    }

    /// Deliver `text` to every live session. Returns the number reached.
    pub fn broadcast(&self, from: &str, text: &str) -> usize {
        let sessions = self.shared.registry.snapshot();
        for session in &sessions {
            session.push_message(ClientMessage::Broadcast {
                from: from.to_string(),
                text: text.to_string(),
            });
        }
        self.shared.emit(AdminEvent::Message(format!("{}: {}", from, text)));
        sessions.len()
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    async fn commit_internal(&self, mut edits: EditSet) -> Result<()> {
        let owner = internal_owner("accounts");
        let result = self.shared.commit_edits(&owner, &mut edits, || Ok(())).await;
        if result.is_err() {
            edits.abort();
        }
        result.map(|_| ())
    }

    async fn ensure_unused(&self, base: BaseId, label: &str, field: &str) -> Result<()> {
        let owner = internal_owner("accounts");
        let taken = with_read_lock(&self.shared, &owner, [base], |store| {
            store.find_by_label(base, label)
        })
        .await?;
        match taken.first() {
            Some(existing) => Err(DbError::ValidationFailed {
                invid: existing.invid(),
                field: field.to_string(),
                message: format!("'{}' is already in use", label),
            }),
            None => Ok(()),
        }
    }

    /// Create a user account.
    pub async fn create_user(&self, name: &str, password: &str) -> Result<Invid> {
        let shared = &self.shared;
        self.ensure_unused(USER_BASE, name, "Username").await?;
        let mut user = DbObject::new(shared.store.reserve_invid(USER_BASE)?);
        user.set(user_fields::USERNAME, name.into());
        user.set(
            user_fields::PASSWORD,
            Value::Password(hash_password_blocking(password, shared.config.bcrypt_cost).await?),
        );
        let invid = user.invid();

        let mut edits = EditSet::new(format!("create user {}", name), false, shared.clock.now());
        edits.create(user)?;
        self.commit_internal(edits).await?;
        info!(%invid, name, "user created");
        Ok(invid)
    }

    /// Create an admin persona, optionally tied to a user account.
    pub async fn create_persona(
        &self,
        label: &str,
        password: &str,
        user: Option<Invid>,
        privilege: AdminPrivilege,
    ) -> Result<Invid> {
        let shared = &self.shared;
        self.ensure_unused(PERSONA_BASE, label, "Label").await?;
        let mut persona = DbObject::new(shared.store.reserve_invid(PERSONA_BASE)?);
        persona.set(persona_fields::LABEL, label.into());
        let name = label.rsplit(':').next().unwrap_or(label);
        persona.set(persona_fields::NAME, name.into());
        persona.set(
            persona_fields::PASSWORD,
            Value::Password(hash_password_blocking(password, shared.config.bcrypt_cost).await?),
        );
        if let Some(user) = user {
            persona.set(persona_fields::ASSOC_USER, Value::Reference(user));
        }
        persona.set(persona_fields::ADMIN_CONSOLE, (privilege >= AdminPrivilege::Basic).into());
        persona.set(persona_fields::ADMIN_POWER, (privilege >= AdminPrivilege::Full).into());
        persona.set(
            persona_fields::INTERPRETER_POWER,
            (privilege == AdminPrivilege::Interpreter).into(),
        );
        let invid = persona.invid();

        let mut edits = EditSet::new(format!("create persona {}", label), false, shared.clock.now());
        edits.create(persona)?;
        self.commit_internal(edits).await?;
        info!(%invid, label, %privilege, "persona created");
        Ok(invid)
    }

    pub fn login_count(&self) -> usize {
        self.shared.login_gate.count()
    }
}
