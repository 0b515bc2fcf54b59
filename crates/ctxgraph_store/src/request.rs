//! Fetch requests.

use crate::change::StoredRow;
use crate::value::Value;
use std::cmp::Ordering;

/// A single condition on a field.
///
/// A missing field compares as `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals the value.
    Equals(String, Value),
    /// Field differs from the value.
    NotEquals(String, Value),
    /// Field orders strictly after the value.
    GreaterThan(String, Value),
    /// Field orders strictly before the value.
    LessThan(String, Value),
}

impl Predicate {
    /// Evaluates the predicate against a set of fields.
    pub fn matches(&self, lookup: impl Fn(&str) -> Option<Value>) -> bool {
        let (field, expected) = match self {
            Predicate::Equals(f, v)
            | Predicate::NotEquals(f, v)
            | Predicate::GreaterThan(f, v)
            | Predicate::LessThan(f, v) => (f, v),
        };
        let actual = lookup(field).unwrap_or(Value::Null);
        let ordering = actual.compare(expected);
        match self {
            Predicate::Equals(..) => ordering == Some(Ordering::Equal),
            Predicate::NotEquals(..) => ordering != Some(Ordering::Equal),
            Predicate::GreaterThan(..) => ordering == Some(Ordering::Greater),
            Predicate::LessThan(..) => ordering == Some(Ordering::Less),
        }
    }
}

/// A read request against one entity.
///
/// Results are ordered by permanent id so repeated fetches are stable.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Entity to read.
    pub entity: String,
    /// All predicates must hold.
    pub filter: Vec<Predicate>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

impl FetchRequest {
    /// Fetches every row of `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter: Vec::new(),
            limit: None,
        }
    }

    /// Adds an equality condition.
    #[must_use]
    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter
            .push(Predicate::Equals(field.into(), value.into()));
        self
    }

    /// Adds an arbitrary predicate.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter.push(predicate);
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the row belongs to the entity and satisfies every predicate.
    #[must_use]
    pub fn matches_row(&self, row: &StoredRow) -> bool {
        row.entity == self.entity && self.matches_fields(|f| row.fields.get(f).cloned())
    }

    /// Evaluates only the predicates.
    pub fn matches_fields(&self, lookup: impl Fn(&str) -> Option<Value>) -> bool {
        self.filter.iter().all(|p| p.matches(&lookup))
    }
}
