//! Records: context-owned instances of persistent entities.

use crate::context::{ContextNode, NodeKind};
use crate::error::{fatal, CoreResult, UsageFault};
use crate::types::{NodeId, TemporaryId};
use ctxgraph_store::{PermanentId, Value};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

/// Local state of a record relative to its owning context's parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Matches the parent.
    Clean,
    /// Created in this context and not yet committed.
    Inserted,
    /// Has field changes not yet committed.
    Updated,
    /// Marked for deletion, or removed by a merge.
    Deleted,
}

pub(crate) struct RecordState {
    pub(crate) permanent_id: Option<PermanentId>,
    pub(crate) fields: BTreeMap<String, Value>,
    pub(crate) changed: BTreeSet<String>,
    pub(crate) status: RecordStatus,
}

struct RecordInner {
    temporary_id: TemporaryId,
    entity: String,
    owner: Weak<ContextNode>,
    owner_id: NodeId,
    state: RwLock<RecordState>,
}

/// One persistent entity instance, owned by exactly one context.
///
/// Cloning a `Record` yields another handle to the same instance. The same
/// logical entity seen from two contexts is two distinct instances linked by
/// their permanent id.
///
/// Field access is checked against the calling thread's binding on every
/// call. Reads need the thread to be bound to the owning context; writes
/// additionally need that context to be a write context inside an active
/// transaction. Violations panic.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl Record {
    pub(crate) fn new(
        owner: &Arc<ContextNode>,
        entity: impl Into<String>,
        permanent_id: Option<PermanentId>,
        fields: BTreeMap<String, Value>,
        status: RecordStatus,
    ) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                temporary_id: TemporaryId::next(),
                entity: entity.into(),
                owner: Arc::downgrade(owner),
                owner_id: owner.id(),
                state: RwLock::new(RecordState {
                    permanent_id,
                    fields,
                    changed: BTreeSet::new(),
                    status,
                }),
            }),
        }
    }

    /// Returns the context-local identity.
    #[must_use]
    pub fn temporary_id(&self) -> TemporaryId {
        self.inner.temporary_id
    }

    /// Returns the storage identity, once one has been assigned.
    #[must_use]
    pub fn permanent_id(&self) -> Option<PermanentId> {
        self.inner.state.read().permanent_id
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.inner.entity
    }

    /// Returns the id of the owning context.
    #[must_use]
    pub fn owner_id(&self) -> NodeId {
        self.inner.owner_id
    }

    /// Reads a field; unset fields read as [`Value::Null`].
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to the owning context or the
    /// entity has no such field.
    #[track_caller]
    pub fn get(&self, field: &str) -> Value {
        let owner = self.checked_owner(false);
        if owner.schema_field(&self.inner.entity, field).is_none() {
            fatal(UsageFault::SchemaViolation {
                message: format!("unknown field {}.{field}", self.inner.entity),
            });
        }
        let _gate = owner.read_gate();
        self.inner
            .state
            .read()
            .fields
            .get(field)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Writes a field.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread may not write this record (see the type
    /// docs) or the schema rejects the value.
    #[track_caller]
    pub fn set(&self, field: &str, value: impl Into<Value>) {
        let value = value.into();
        let owner = self.checked_owner(true);
        if let Err(err) = owner.check_field(&self.inner.entity, field, &value) {
            fatal(UsageFault::SchemaViolation {
                message: err.to_string(),
            });
        }
        {
            let mut state = self.inner.state.write();
            state.fields.insert(field.to_string(), value);
            state.changed.insert(field.to_string());
            if state.status == RecordStatus::Clean {
                state.status = RecordStatus::Updated;
            }
        }
        owner.mark_dirty(self.inner.temporary_id);
    }

    /// Points a reference field at `target`, or clears it with `None`.
    ///
    /// A target without a permanent id gets one allocated first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdentityAllocation`](crate::CoreError) if the
    /// target needs an id and the engine cannot allocate one.
    ///
    /// # Panics
    ///
    /// Panics if `target` belongs to a different context.
    #[track_caller]
    pub fn set_reference(&self, field: &str, target: Option<&Record>) -> CoreResult<()> {
        let owner = self.checked_owner(true);
        let value = match target {
            None => Value::Null,
            Some(target) => {
                owner
                    .bindings()
                    .check_relationship(field, self.owner_id(), target.owner_id());
                match target.permanent_id() {
                    Some(id) => Value::Reference(id),
                    None => {
                        owner.obtain_permanent_ids(std::slice::from_ref(target))?;
                        target.permanent_id().map_or(Value::Null, Value::Reference)
                    }
                }
            }
        };
        self.set(field, value);
        Ok(())
    }

    /// Resolves a reference field within the owning context.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Fetch`](crate::CoreError) if the target has to be
    /// loaded and the engine cannot answer.
    #[track_caller]
    pub fn reference(&self, field: &str) -> CoreResult<Option<Record>> {
        match self.get(field).as_reference() {
            Some(id) => self.checked_owner(false).object(id),
            None => Ok(None),
        }
    }

    /// Returns a snapshot of every set field.
    #[track_caller]
    #[must_use]
    pub fn fields(&self) -> BTreeMap<String, Value> {
        let owner = self.checked_owner(false);
        let _gate = owner.read_gate();
        self.inner.state.read().fields.clone()
    }

    /// Returns the record's status relative to the parent context.
    #[track_caller]
    #[must_use]
    pub fn status(&self) -> RecordStatus {
        let owner = self.checked_owner(false);
        let _gate = owner.read_gate();
        self.inner.state.read().status
    }

    /// Returns true if the record has uncommitted changes.
    #[track_caller]
    #[must_use]
    pub fn has_changes(&self) -> bool {
        let owner = self.checked_owner(false);
        let _gate = owner.read_gate();
        owner.kind() == NodeKind::Write && self.inner.state.read().status != RecordStatus::Clean
    }

    /// Returns true once the record has been deleted.
    #[track_caller]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.status() == RecordStatus::Deleted
    }

    #[track_caller]
    fn checked_owner(&self, for_write: bool) -> Arc<ContextNode> {
        let owner = self.owner();
        owner
            .bindings()
            .check_access(&owner, &self.inner.entity, for_write);
        owner
    }

    /// Returns the owning context, without an affinity check.
    #[track_caller]
    pub(crate) fn owner(&self) -> Arc<ContextNode> {
        match self.inner.owner.upgrade() {
            Some(owner) => owner,
            None => fatal(UsageFault::DestroyedContext {
                node: self.inner.owner_id,
            }),
        }
    }

    pub(crate) fn try_owner(&self) -> Option<Arc<ContextNode>> {
        self.inner.owner.upgrade()
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, RecordState> {
        self.inner.state.read()
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, RecordState> {
        self.inner.state.write()
    }

    /// Returns true if both handles point at the same instance.
    #[must_use]
    pub fn same_instance(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("entity", &self.inner.entity)
            .field("temporary_id", &self.inner.temporary_id)
            .field("permanent_id", &self.permanent_id())
            .field("owner", &self.inner.owner_id)
            .finish()
    }
}
