use super::{BaseId, DbError, FieldId, FieldKind, Invid, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: FieldId,
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldDef {
    pub fn new(id: FieldId, name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if !self.kind.is_compatible(value) {
            return Err(DbError::TypeMismatch(format!(
                "Field '{}' expects type {}, got {}",
                self.name,
                self.kind,
                value.type_name()
            )));
        }
        Ok(())
    }
}

/// Definition of an object base: its fields and which one labels its objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseSchema {
    pub id: BaseId,
    pub name: String,
    fields: Vec<FieldDef>,
    label_field: Option<FieldId>,
}

impl BaseSchema {
    pub fn new(id: BaseId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            fields: Vec::new(),
            label_field: None,
        }
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_label(mut self, field: FieldId) -> Self {
        self.label_field = Some(field);
        self
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn label_field(&self) -> Option<FieldId> {
        self.label_field
    }

    pub fn require_field(&self, id: FieldId) -> Result<&FieldDef> {
        self.field(id)
            .ok_or_else(|| DbError::FieldNotFound(id.to_string(), self.name.clone()))
    }
}

/// A stored object. Unset fields are simply absent from the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbObject {
    invid: Invid,
    fields: BTreeMap<FieldId, Value>,
}

impl DbObject {
    pub fn new(invid: Invid) -> Self {
        Self {
            invid,
            fields: BTreeMap::new(),
        }
    }

    pub fn invid(&self) -> Invid {
        self.invid
    }

    pub fn get(&self, field: FieldId) -> Option<&Value> {
        self.fields.get(&field)
    }

    pub fn is_set(&self, field: FieldId) -> bool {
        self.fields.get(&field).is_some_and(|v| !v.is_empty())
    }

    pub fn flag(&self, field: FieldId) -> bool {
        matches!(self.fields.get(&field), Some(Value::Boolean(true)))
    }

    pub fn set(&mut self, field: FieldId, value: Value) {
        self.fields.insert(field, value);
    }

    pub fn clear(&mut self, field: FieldId) -> Option<Value> {
        self.fields.remove(&field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &Value)> {
        self.fields.iter().map(|(id, v)| (*id, v))
    }

    pub(crate) fn fields_mut(&mut self) -> &mut BTreeMap<FieldId, Value> {
        &mut self.fields
    }

    /// Every outgoing reference held by this object.
    pub fn references(&self) -> impl Iterator<Item = (FieldId, Invid)> + '_ {
        self.fields
            .iter()
            .flat_map(|(id, v)| v.references().iter().map(move |target| (*id, *target)))
    }

    pub fn label(&self, schema: &BaseSchema) -> String {
        schema
            .label_field()
            .and_then(|f| self.fields.get(&f))
            .map(|v| v.to_string())
            .unwrap_or_else(|| self.invid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> BaseSchema {
        BaseSchema::new(10, "host")
            .with_field(FieldDef::new(1, "name", FieldKind::Text).required())
            .with_field(FieldDef::new(2, "owner", FieldKind::Reference { target: Some(3) }))
            .with_label(1)
    }

    #[test]
    fn test_label_falls_back_to_invid() {
        let schema = schema();
        let mut obj = DbObject::new(Invid::new(10, 4));
        assert_eq!(obj.label(&schema), "10:4");
        obj.set(1, "gatekeeper".into());
        assert_eq!(obj.label(&schema), "gatekeeper");
    }

    #[test]
    fn test_field_validation() {
        let schema = schema();
        let owner = schema.field(2).unwrap();
        assert!(owner.validate(&Value::Reference(Invid::new(3, 1))).is_ok());
        assert!(owner.validate(&Value::Integer(1)).is_err());
    }

    #[test]
    fn test_references_iterates_vectors() {
        let mut obj = DbObject::new(Invid::new(10, 1));
        obj.set(2, Value::Reference(Invid::new(3, 1)));
        obj.set(5, Value::References(vec![Invid::new(3, 2), Invid::new(3, 3)]));
        assert_eq!(obj.references().count(), 3);
    }
}
