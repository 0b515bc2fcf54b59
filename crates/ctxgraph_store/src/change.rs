//! Rows and change sets exchanged with engines.

use crate::error::PersistenceError;
use crate::id::PermanentId;
use crate::schema::Schema;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A persisted record as the engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Identity.
    pub id: PermanentId,
    /// Entity name.
    pub entity: String,
    /// Field values; absent fields read as null.
    pub fields: BTreeMap<String, Value>,
}

impl StoredRow {
    /// Creates a row with no fields.
    pub fn new(id: PermanentId, entity: impl Into<String>) -> Self {
        Self {
            id,
            entity: entity.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// One change to the persisted rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowChange {
    /// A new row.
    Insert {
        /// The complete row.
        row: StoredRow,
    },
    /// Overlay of touched fields onto an existing row.
    Update {
        /// Target row.
        id: PermanentId,
        /// Entity name of the target.
        entity: String,
        /// Only the fields that changed.
        fields: BTreeMap<String, Value>,
    },
    /// Removal of an existing row.
    Delete {
        /// Target row.
        id: PermanentId,
        /// Entity name of the target.
        entity: String,
    },
}

impl RowChange {
    /// Identity the change targets.
    #[must_use]
    pub fn id(&self) -> PermanentId {
        match self {
            RowChange::Insert { row } => row.id,
            RowChange::Update { id, .. } | RowChange::Delete { id, .. } => *id,
        }
    }

    /// Entity name the change targets.
    #[must_use]
    pub fn entity(&self) -> &str {
        match self {
            RowChange::Insert { row } => &row.entity,
            RowChange::Update { entity, .. } | RowChange::Delete { entity, .. } => entity,
        }
    }
}

/// An ordered batch of changes persisted as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Changes in application order.
    pub changes: Vec<RowChange>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a change.
    pub fn push(&mut self, change: RowChange) {
        self.changes.push(change);
    }

    /// Returns true if there is nothing to persist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Applies the set to `rows`, all or nothing.
    ///
    /// The changes are first staged against the affected rows; `rows` is only
    /// modified once every change has been validated.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Constraint`] for inserts of existing ids or
    /// updates/deletes of missing rows, and [`PersistenceError::Schema`] for
    /// fields the schema rejects.
    pub fn apply_to(
        &self,
        rows: &mut BTreeMap<PermanentId, StoredRow>,
        schema: &Schema,
    ) -> Result<(), PersistenceError> {
        let mut staged: BTreeMap<PermanentId, Option<StoredRow>> = BTreeMap::new();

        for change in &self.changes {
            let id = change.id();
            let current = match staged.get(&id) {
                Some(entry) => entry.clone(),
                None => rows.get(&id).cloned(),
            };

            let next = match (change, current) {
                (RowChange::Insert { row }, None) => {
                    if !schema.contains(&row.entity) {
                        return Err(PersistenceError::constraint(format!(
                            "unknown entity `{}`",
                            row.entity
                        )));
                    }
                    for (field, value) in &row.fields {
                        schema.check_field(&row.entity, field, value)?;
                    }
                    Some(row.clone())
                }
                (RowChange::Insert { .. }, Some(_)) => {
                    return Err(PersistenceError::constraint(format!(
                        "row {id} already exists"
                    )));
                }
                (RowChange::Update { entity, fields, .. }, Some(mut existing)) => {
                    if existing.entity != *entity {
                        return Err(PersistenceError::constraint(format!(
                            "row {id} is a `{}`, not a `{entity}`",
                            existing.entity
                        )));
                    }
                    for (field, value) in fields {
                        schema.check_field(entity, field, value)?;
                        existing.fields.insert(field.clone(), value.clone());
                    }
                    Some(existing)
                }
                (RowChange::Delete { .. }, Some(_)) => None,
                (RowChange::Update { .. } | RowChange::Delete { .. }, None) => {
                    return Err(PersistenceError::constraint(format!(
                        "row {id} does not exist"
                    )));
                }
            };
            staged.insert(id, next);
        }

        for (id, row) in staged {
            match row {
                Some(row) => {
                    rows.insert(id, row);
                }
                None => {
                    rows.remove(&id);
                }
            }
        }
        Ok(())
    }
}

impl From<Vec<RowChange>> for ChangeSet {
    fn from(changes: Vec<RowChange>) -> Self {
        Self { changes }
    }
}
