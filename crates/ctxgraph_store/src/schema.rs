//! Entity schema.
//!
//! A schema is the closed set of record kinds a store accepts. Every field
//! is typed and nullable; `FieldKind::Any` opts a field out of type checks.

use crate::value::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// `Value::Bool`.
    Bool,
    /// `Value::Integer`.
    Integer,
    /// `Value::Float`.
    Float,
    /// `Value::Text`.
    Text,
    /// `Value::Bytes`.
    Bytes,
    /// `Value::Reference`.
    Reference,
    /// Any value.
    Any,
}

impl FieldKind {
    /// Returns true if `value` may be stored in a field of this kind.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value.kind()) {
            (_, None) | (FieldKind::Any, _) => true,
            (expected, Some(actual)) => expected == actual,
        }
    }
}

/// Schema violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// The entity is not declared.
    #[error("unknown entity `{entity}`")]
    UnknownEntity {
        /// Entity name.
        entity: String,
    },

    /// The field is not declared on the entity.
    #[error("unknown field `{field}` on `{entity}`")]
    UnknownField {
        /// Entity name.
        entity: String,
        /// Field name.
        field: String,
    },

    /// The value does not match the declared kind.
    #[error("field `{entity}.{field}` expects {expected:?}, got {actual:?}")]
    TypeMismatch {
        /// Entity name.
        entity: String,
        /// Field name.
        field: String,
        /// Declared kind.
        expected: FieldKind,
        /// Kind of the offending value.
        actual: Option<FieldKind>,
    },
}

/// Definition of one record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    name: String,
    fields: BTreeMap<String, FieldKind>,
}

impl EntityDef {
    /// Starts a definition with no fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Declares a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    /// Entity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared kind of `field`.
    #[must_use]
    pub fn field_kind(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).copied()
    }

    /// Declared fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// The set of entities a store accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    entities: BTreeMap<String, EntityDef>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity definition, replacing any previous one of that name.
    #[must_use]
    pub fn with_entity(mut self, def: EntityDef) -> Self {
        self.entities.insert(def.name.clone(), def);
        self
    }

    /// Looks up an entity.
    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.get(name)
    }

    /// Returns true if the entity is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Iterates entity definitions in name order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    /// Checks that `value` may be stored in `entity.field`.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] naming the first mismatch.
    pub fn check_field(&self, entity: &str, field: &str, value: &Value) -> Result<(), SchemaError> {
        let def = self
            .entities
            .get(entity)
            .ok_or_else(|| SchemaError::UnknownEntity {
                entity: entity.to_string(),
            })?;
        let kind = def
            .field_kind(field)
            .ok_or_else(|| SchemaError::UnknownField {
                entity: entity.to_string(),
                field: field.to_string(),
            })?;
        if kind.accepts(value) {
            Ok(())
        } else {
            Err(SchemaError::TypeMismatch {
                entity: entity.to_string(),
                field: field.to_string(),
                expected: kind,
                actual: value.kind(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new().with_entity(
            EntityDef::new("Page")
                .field("title", FieldKind::Text)
                .field("visits", FieldKind::Integer)
                .field("extra", FieldKind::Any),
        )
    }

    #[test]
    fn accepts_declared_field() {
        assert!(schema()
            .check_field("Page", "visits", &Value::Integer(3))
            .is_ok());
    }

    #[test]
    fn null_is_always_accepted() {
        assert!(schema().check_field("Page", "title", &Value::Null).is_ok());
    }

    #[test]
    fn any_accepts_everything() {
        assert!(schema()
            .check_field("Page", "extra", &Value::Bytes(vec![1]))
            .is_ok());
    }

    #[test]
    fn rejects_unknown_entity_and_field() {
        let schema = schema();
        assert!(matches!(
            schema.check_field("Nope", "title", &Value::Null),
            Err(SchemaError::UnknownEntity { .. })
        ));
        assert!(matches!(
            schema.check_field("Page", "nope", &Value::Null),
            Err(SchemaError::UnknownField { .. })
        ));
    }

    #[test]
    fn rejects_type_mismatch() {
        let err = schema()
            .check_field("Page", "visits", &Value::Text("x".into()))
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::TypeMismatch {
                entity: "Page".into(),
                field: "visits".into(),
                expected: FieldKind::Integer,
                actual: Some(FieldKind::Text),
            }
        );
    }
}
