use crate::core::Invid;
use crate::session::Session;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

fn key(name: &str) -> String {
    name.to_lowercase()
}

#[derive(Default)]
struct RegistryInner {
    /// Live sessions by lowercased registered name.
    sessions: BTreeMap<String, Session>,
    last_logout: HashMap<Invid, DateTime<Utc>>,
}

/// Live-session registry.
///
/// Bulk operations work on [`SessionRegistry::snapshot`] so per-session work
/// (forcing off, idle checks) never runs under the registry lock.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the session `make` builds under a unique name derived from
    /// `label`: "alice", then "alice[2]", "alice[3]" while earlier ones are
    /// live. Names are unique ignoring case; the session keeps the label's
    /// spelling.
    pub fn register_with<F>(&self, label: &str, make: F) -> Session
    where
        F: FnOnce(String) -> Session,
    {
        let mut inner = self.inner();
        let mut name = label.to_string();
        let mut suffix = 2;
        while inner.sessions.contains_key(&key(&name)) {
            name = format!("{}[{}]", label, suffix);
            suffix += 1;
        }
        let session = make(name.clone());
        inner.sessions.insert(key(&name), session.clone());
        session
    }

    /// Remove `session` if it is still registered. Returns the number of
    /// sessions left, or None if it was not registered.
    pub fn remove(&self, session: &Session, now: DateTime<Utc>) -> Option<usize> {
        let mut inner = self.inner();
        let name = key(session.name());
        let registered = inner.sessions.get(&name).is_some_and(|s| s.same(session));
        if !registered {
            return None;
        }
        inner.sessions.remove(&name);
        if let Some(user) = session.identity().user {
            inner.last_logout.insert(user, now);
        }
        Some(inner.sessions.len())
    }

    /// Case-insensitive lookup by registered name.
    pub fn get(&self, name: &str) -> Option<Session> {
        self.inner().sessions.get(&key(name)).cloned()
    }

    /// Copy of the live sessions, taken under the lock and released at once.
    pub fn snapshot(&self) -> Vec<Session> {
        self.inner().sessions.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner()
            .sessions
            .values()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When `user` last logged out, if ever.
    pub fn last_logout(&self, user: Invid) -> Option<DateTime<Utc>> {
        self.inner().last_logout.get(&user).copied()
    }
}
