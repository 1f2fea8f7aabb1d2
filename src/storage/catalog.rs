use crate::core::{BaseId, BaseSchema, DbError, FieldDef, FieldKind, Invid, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Administrative identities layered over user accounts.
pub const PERSONA_BASE: BaseId = 1;
/// Plain user accounts.
pub const USER_BASE: BaseId = 3;

/// Root persona, always present and always fully privileged.
pub const SUPERGASH: Invid = Invid::new(PERSONA_BASE, 1);
pub const SUPERGASH_LABEL: &str = "supergash";

/// First base number handed out to user-defined schemas.
pub const FIRST_USER_BASE: BaseId = 256;

pub mod user_fields {
    use crate::core::FieldId;

    pub const USERNAME: FieldId = 100;
    pub const PASSWORD: FieldId = 101;
    pub const INACTIVATED: FieldId = 102;
}

pub mod persona_fields {
    use crate::core::FieldId;

    /// Full persona label, "alice:Admin" or just "supergash".
    pub const LABEL: FieldId = 100;
    pub const NAME: FieldId = 101;
    pub const PASSWORD: FieldId = 102;
    pub const ASSOC_USER: FieldId = 103;
    pub const ADMIN_CONSOLE: FieldId = 104;
    pub const ADMIN_POWER: FieldId = 105;
    pub const INTERPRETER_POWER: FieldId = 106;
}

/// Schema metadata for every object base in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    bases: BTreeMap<BaseId, BaseSchema>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the account bases every server needs for login.
    pub fn with_builtins() -> Self {
        let users = BaseSchema::new(USER_BASE, "User")
            .with_field(FieldDef::new(user_fields::USERNAME, "Username", FieldKind::Text).required())
            .with_field(FieldDef::new(user_fields::PASSWORD, "Password", FieldKind::Password))
            .with_field(FieldDef::new(user_fields::INACTIVATED, "Inactivated", FieldKind::Boolean))
            .with_label(user_fields::USERNAME);

        let personas = BaseSchema::new(PERSONA_BASE, "Admin Persona")
            .with_field(FieldDef::new(persona_fields::LABEL, "Label", FieldKind::Text).required())
            .with_field(FieldDef::new(persona_fields::NAME, "Name", FieldKind::Text).required())
            .with_field(FieldDef::new(persona_fields::PASSWORD, "Password", FieldKind::Password))
            .with_field(FieldDef::new(
                persona_fields::ASSOC_USER,
                "User",
                FieldKind::Reference { target: Some(USER_BASE) },
            ))
            .with_field(FieldDef::new(persona_fields::ADMIN_CONSOLE, "Admin Console", FieldKind::Boolean))
            .with_field(FieldDef::new(persona_fields::ADMIN_POWER, "Full Console Privileges", FieldKind::Boolean))
            .with_field(FieldDef::new(persona_fields::INTERPRETER_POWER, "Interpreter Privileges", FieldKind::Boolean))
            .with_label(persona_fields::LABEL);

        let mut catalog = Self::new();
        catalog.bases.insert(PERSONA_BASE, personas);
        catalog.bases.insert(USER_BASE, users);
        catalog
    }

    pub fn add_base(&mut self, schema: BaseSchema) -> Result<()> {
        if self.bases.contains_key(&schema.id) {
            return Err(DbError::ConfigError(format!(
                "Object base {} ({}) already defined",
                schema.id, schema.name
            )));
        }
        if self.bases.values().any(|b| b.name.eq_ignore_ascii_case(&schema.name)) {
            return Err(DbError::ConfigError(format!(
                "Object base name '{}' already in use",
                schema.name
            )));
        }
        self.bases.insert(schema.id, schema);
        Ok(())
    }

    pub fn base(&self, id: BaseId) -> Result<&BaseSchema> {
        self.bases.get(&id).ok_or(DbError::BaseNotFound(id))
    }

    pub fn base_by_name(&self, name: &str) -> Option<&BaseSchema> {
        self.bases.values().find(|b| b.name.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, id: BaseId) -> bool {
        self.bases.contains_key(&id)
    }

    pub fn base_ids(&self) -> Vec<BaseId> {
        self.bases.keys().copied().collect()
    }

    pub fn bases(&self) -> impl Iterator<Item = &BaseSchema> {
        self.bases.values()
    }

    /// Next free id at or above [`FIRST_USER_BASE`].
    pub fn next_base_id(&self) -> BaseId {
        self.bases
            .keys()
            .copied()
            .filter(|id| *id >= FIRST_USER_BASE)
            .max()
            .map_or(FIRST_USER_BASE, |id| id + 1)
    }
}
