use crate::core::{DbError, DbObject, FieldId, Invid, Result, Value};
use crate::storage::{ObjectStore, PERSONA_BASE, SUPERGASH, USER_BASE, persona_fields, user_fields};
use serde::Serialize;
use std::fmt;

/// Hashes a password using bcrypt
///
/// Each hash carries its own random salt, so equal passwords hash differently.
pub fn hash_password(password: &str, cost: u32) -> Result<String> {
    bcrypt::hash(password, cost).map_err(|e| DbError::Fatal(format!("Failed to hash password: {}", e)))
}

/// Verifies password against bcrypt hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// [`hash_password`] on the blocking thread pool, off the async workers.
pub async fn hash_password_blocking(password: &str, cost: u32) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || hash_password(&password, cost))
        .await
        .map_err(|e| DbError::Fatal(format!("Password hashing task failed: {}", e)))?
}

fn password_matches(obj: &DbObject, field: FieldId, password: &str) -> bool {
    matches!(obj.get(field), Some(Value::Password(hash)) if verify_password(password, hash))
}

/// Admin console access level granted by a persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AdminPrivilege {
    None,
    /// May attach and watch.
    Basic,
    /// May kill users, control tasks, dump, sweep and shut down.
    Full,
    Interpreter,
}

impl AdminPrivilege {
    pub fn of_persona(persona: &DbObject) -> Self {
        if persona.invid() == SUPERGASH {
            return AdminPrivilege::Interpreter;
        }
        if !persona.flag(persona_fields::ADMIN_CONSOLE) {
            AdminPrivilege::None
        } else if !persona.flag(persona_fields::ADMIN_POWER) {
            AdminPrivilege::Basic
        } else if !persona.flag(persona_fields::INTERPRETER_POWER) {
            AdminPrivilege::Full
        } else {
            AdminPrivilege::Interpreter
        }
    }

    pub fn can_view(&self) -> bool {
        *self >= AdminPrivilege::Basic
    }

    pub fn can_control(&self) -> bool {
        *self >= AdminPrivilege::Full
    }
}

impl fmt::Display for AdminPrivilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminPrivilege::None => write!(f, "none"),
            AdminPrivilege::Basic => write!(f, "basic"),
            AdminPrivilege::Full => write!(f, "full"),
            AdminPrivilege::Interpreter => write!(f, "interpreter"),
        }
    }
}

/// Who a successful login authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Canonical label from the matched object, e.g. "alice" or "alice:Admin".
    pub label: String,
    pub user: Option<Invid>,
    pub persona: Option<Invid>,
    pub privilege: AdminPrivilege,
}

enum PersonaMatch {
    Matched(Identity),
    /// Password matched but the persona's account is inactivated.
    Refused,
    NoMatch,
}

/// Check `name`/`password` against the persona base, then the user base.
///
/// Callers must hold a read lock covering both account bases. Personas are
/// matched on their full label ignoring case; when several share a label
/// each candidate's password is tried in turn. A persona whose underlying
/// user is inactivated is refused outright.
pub fn authenticate(store: &ObjectStore, name: &str, password: &str) -> Result<Option<Identity>> {
    match match_persona(store, name, password)? {
        PersonaMatch::Matched(identity) => Ok(Some(identity)),
        PersonaMatch::Refused => Ok(None),
        PersonaMatch::NoMatch => match_user(store, name, password),
    }
}

fn match_persona(store: &ObjectStore, name: &str, password: &str) -> Result<PersonaMatch> {
    let candidates = store.find_by_label(PERSONA_BASE, name)?;
    if candidates.is_empty() {
        return Ok(PersonaMatch::NoMatch);
    }

    // "alice:Admin" belongs to the account "alice"
    let base_user = match name.split_once(':') {
        Some((prefix, _)) => store.find_by_label(USER_BASE, prefix)?.into_iter().next(),
        None => None,
    };

    let schema = store.schema(PERSONA_BASE)?;
    for persona in candidates {
        if !password_matches(&persona, persona_fields::PASSWORD, password) {
            continue;
        }
        let user = match persona.get(persona_fields::ASSOC_USER) {
            Some(Value::Reference(invid)) => store.get(*invid)?,
            _ => base_user.clone(),
        };
        if user.as_ref().is_some_and(|u| u.flag(user_fields::INACTIVATED)) {
            return Ok(PersonaMatch::Refused);
        }
        return Ok(PersonaMatch::Matched(Identity {
            label: persona.label(&schema),
            user: user.map(|u| u.invid()),
            persona: Some(persona.invid()),
            privilege: AdminPrivilege::of_persona(&persona),
        }));
    }
    Ok(PersonaMatch::NoMatch)
}

fn match_user(store: &ObjectStore, name: &str, password: &str) -> Result<Option<Identity>> {
    let schema = store.schema(USER_BASE)?;
    for user in store.find_by_label(USER_BASE, name)? {
        if user.flag(user_fields::INACTIVATED) {
            continue;
        }
        if password_matches(&user, user_fields::PASSWORD, password) {
            return Ok(Some(Identity {
                label: user.label(&schema),
                user: Some(user.invid()),
                persona: None,
                privilege: AdminPrivilege::None,
            }));
        }
    }
    Ok(None)
}
