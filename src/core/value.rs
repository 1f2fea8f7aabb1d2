use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Object base identifier.
pub type BaseId = u16;

/// Field identifier, unique within one object base.
pub type FieldId = u16;

/// Typed, stable reference to an object: the base it lives in plus its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Invid {
    pub base: BaseId,
    pub num: u32,
}

impl Invid {
    pub const fn new(base: BaseId, num: u32) -> Self {
        Self { base, num }
    }
}

impl fmt::Display for Invid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.base, self.num)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Text(String),
    Boolean(bool),
    Date(DateTime<Utc>),
    /// A bcrypt hash, never plain text.
    Password(String),
    Reference(Invid),
    References(Vec<Invid>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "INTEGER",
            Self::Text(_) => "TEXT",
            Self::Boolean(_) => "BOOLEAN",
            Self::Date(_) => "DATE",
            Self::Password(_) => "PASSWORD",
            Self::Reference(_) => "REFERENCE",
            Self::References(_) => "REFERENCES",
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Text(s) => !s.is_empty(),
            Self::References(v) => !v.is_empty(),
            _ => true,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Every object this value points at, scalar or vector.
    pub fn references(&self) -> &[Invid] {
        match self {
            Self::Reference(invid) => std::slice::from_ref(invid),
            Self::References(invids) => invids,
            _ => &[],
        }
    }

    /// An empty reference vector is treated the same as an unset field.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::References(v) => v.is_empty(),
            Self::Text(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "{}", s),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Self::Password(_) => write!(f, "********"),
            Self::Reference(invid) => write!(f, "{}", invid),
            Self::References(invids) => {
                let parts: Vec<String> = invids.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Invid> for Value {
    fn from(invid: Invid) -> Self {
        Self::Reference(invid)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Self::Date(date)
    }
}

/// Declared type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Integer,
    Text,
    Boolean,
    Date,
    Password,
    /// Scalar link to an object, optionally restricted to one target base.
    Reference { target: Option<BaseId> },
    /// Vector of links.
    References { target: Option<BaseId> },
}

impl FieldKind {
    pub fn is_compatible(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Integer, Value::Integer(_)) => true,
            (Self::Text, Value::Text(_)) => true,
            (Self::Boolean, Value::Boolean(_)) => true,
            (Self::Date, Value::Date(_)) => true,
            (Self::Password, Value::Password(_)) => true,
            (Self::Reference { target }, Value::Reference(invid)) => {
                target.is_none_or(|base| base == invid.base)
            }
            (Self::References { target }, Value::References(invids)) => {
                invids.iter().all(|invid| target.is_none_or(|base| base == invid.base))
            }
            _ => false,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. } | Self::References { .. })
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "INTEGER"),
            Self::Text => write!(f, "TEXT"),
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::Date => write!(f, "DATE"),
            Self::Password => write!(f, "PASSWORD"),
            Self::Reference { .. } => write!(f, "REFERENCE"),
            Self::References { .. } => write!(f, "REFERENCES"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invid_display() {
        assert_eq!(Invid::new(3, 17).to_string(), "3:17");
    }

    #[test]
    fn test_reference_target_compatibility() {
        let kind = FieldKind::Reference { target: Some(3) };
        assert!(kind.is_compatible(&Value::Reference(Invid::new(3, 1))));
        assert!(!kind.is_compatible(&Value::Reference(Invid::new(4, 1))));
        assert!(!kind.is_compatible(&Value::Text("3:1".into())));
    }

    #[test]
    fn test_references_lists_all_targets() {
        let value = Value::References(vec![Invid::new(1, 1), Invid::new(1, 2)]);
        assert_eq!(value.references().len(), 2);
        assert!(Value::Integer(5).references().is_empty());
    }

    #[test]
    fn test_password_display_is_masked() {
        let value = Value::Password("$2b$04$abc".into());
        assert_eq!(value.to_string(), "********");
    }
}
