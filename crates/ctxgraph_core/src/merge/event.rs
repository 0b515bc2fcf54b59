//! Events emitted after a commit has been merged into the main context.

use crate::types::SequenceNumber;
use ctxgraph_store::{PermanentId, Value};
use std::collections::BTreeMap;

/// How a merge affected one record of the main context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeEventKind {
    /// The record did not exist before the commit.
    Inserted,
    /// A resident record received new field values.
    Updated,
    /// The record was not resident; it was faulted in at its pre-merge
    /// version and then updated.
    Refreshed,
    /// The record was deleted.
    Deleted,
}

/// One record affected by a merged commit.
///
/// Events are dispatched only after the whole commit is visible through
/// the main context.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeEvent {
    /// Sequence of the commit that produced the change.
    pub sequence: SequenceNumber,
    /// Identity of the affected record.
    pub id: PermanentId,
    /// Entity name.
    pub entity: String,
    /// What happened to the record.
    pub kind: MergeEventKind,
    /// Fields the commit touched; empty for deletes.
    pub changed_fields: Vec<String>,
    /// Field values after the merge; `None` for deletes.
    pub fields: Option<BTreeMap<String, Value>>,
}

impl MergeEvent {
    /// Returns true if the event touched `field`.
    #[must_use]
    pub fn touched(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|f| f == field)
    }
}
