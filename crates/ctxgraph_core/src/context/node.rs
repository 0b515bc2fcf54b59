//! Context nodes and their working sets.

use crate::binding::ThreadBindings;
use crate::error::{fatal, CoreResult, UsageFault};
use crate::merge::UnmergedCommits;
use crate::record::{Record, RecordStatus};
use crate::types::{NodeId, TemporaryId};
use ctxgraph_store::{
    FetchRequest, FieldKind, IdentityAllocationError, PermanentId, SchemaError, StoreEngine,
    Value,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Role of a context in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Owns the path to storage; touched only during commit and merge.
    Root,
    /// Shared read-only view, updated only by merges.
    MainRead,
    /// Per-transaction mutable scope.
    Write,
}

/// Records resident in a context.
#[derive(Default)]
struct WorkingSet {
    records: BTreeMap<TemporaryId, Record>,
    by_permanent: HashMap<PermanentId, TemporaryId>,
    dirty: BTreeSet<TemporaryId>,
}

impl WorkingSet {
    fn resident(&self, id: PermanentId) -> Option<&Record> {
        self.by_permanent
            .get(&id)
            .and_then(|tid| self.records.get(tid))
    }

    fn remove(&mut self, record: &Record) {
        let tid = record.temporary_id();
        self.records.remove(&tid);
        self.dirty.remove(&tid);
        if let Some(id) = record.permanent_id() {
            if self.by_permanent.get(&id) == Some(&tid) {
                self.by_permanent.remove(&id);
            }
        }
    }
}

/// An isolated scope of record reads and mutations.
///
/// Write contexts are handed to transaction bodies through
/// [`Transaction::context`](crate::Transaction::context); the main read
/// context through [`Coordinator::main_context`](crate::Coordinator::main_context).
/// Every operation is checked against the calling thread's binding.
pub struct ContextNode {
    id: NodeId,
    kind: NodeKind,
    parent: Option<Arc<ContextNode>>,
    engine: Arc<dyn StoreEngine>,
    bindings: Arc<ThreadBindings>,
    working: RwLock<WorkingSet>,
    /// Held exclusively while a merge batch is applied.
    gate: RwLock<()>,
    /// Set on the main read context only; store reads are rolled back past
    /// these commits.
    unmerged: Option<Arc<UnmergedCommits>>,
}

impl ContextNode {
    pub(crate) fn new(
        id: NodeId,
        kind: NodeKind,
        parent: Option<Arc<ContextNode>>,
        engine: Arc<dyn StoreEngine>,
        bindings: Arc<ThreadBindings>,
    ) -> Arc<Self> {
        Self::build(id, kind, parent, engine, bindings, None)
    }

    /// Creates the main read context, which sees only merged commits.
    pub(crate) fn new_main_read(
        id: NodeId,
        parent: Arc<ContextNode>,
        engine: Arc<dyn StoreEngine>,
        bindings: Arc<ThreadBindings>,
        unmerged: Arc<UnmergedCommits>,
    ) -> Arc<Self> {
        Self::build(
            id,
            NodeKind::MainRead,
            Some(parent),
            engine,
            bindings,
            Some(unmerged),
        )
    }

    fn build(
        id: NodeId,
        kind: NodeKind,
        parent: Option<Arc<ContextNode>>,
        engine: Arc<dyn StoreEngine>,
        bindings: Arc<ThreadBindings>,
        unmerged: Option<Arc<UnmergedCommits>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            parent,
            engine,
            bindings,
            working: RwLock::new(WorkingSet::default()),
            gate: RwLock::new(()),
            unmerged,
        })
    }

    /// Returns this context's id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns this context's role.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns the parent's id; `None` for the root.
    #[must_use]
    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent.as_ref().map(|p| p.id)
    }

    /// Creates a new record of `entity` in this context.
    ///
    /// The record has no permanent id until it is committed or referenced.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread may not write to this context, or the
    /// schema has no such entity.
    #[track_caller]
    pub fn insert(self: &Arc<Self>, entity: &str) -> Record {
        self.bindings.check_access(self, entity, true);
        if !self.engine.schema().contains(entity) {
            fatal(UsageFault::SchemaViolation {
                message: SchemaError::UnknownEntity {
                    entity: entity.to_string(),
                }
                .to_string(),
            });
        }
        let record = Record::new(self, entity, None, BTreeMap::new(), RecordStatus::Inserted);
        let mut working = self.working.write();
        working
            .records
            .insert(record.temporary_id(), record.clone());
        working.dirty.insert(record.temporary_id());
        record
    }

    /// Returns this context's instance of the record with `id`.
    ///
    /// A record not yet resident is faulted in from the store. The main read
    /// context faults in the version of its last merged commit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Fetch`](crate::CoreError) if the engine cannot be read.
    #[track_caller]
    pub fn object(self: &Arc<Self>, id: PermanentId) -> CoreResult<Option<Record>> {
        self.bindings.check_access(self, "", false);
        let _gate = self.read_gate();
        if let Some(record) = self.working.read().resident(id) {
            let live = record.state().status != RecordStatus::Deleted;
            return Ok(live.then(|| record.clone()));
        }
        let row = self.engine.load(id)?;
        let row = match &self.unmerged {
            Some(unmerged) => unmerged.merged_row(id).unwrap_or(row),
            None => row,
        };
        Ok(row.map(|row| self.materialize(row.entity, row.id, row.fields)))
    }

    /// Runs `request` against this context.
    ///
    /// Results reflect the context's pending changes: local inserts that
    /// match are included, local deletes are excluded and resident records
    /// are matched against their local field values. Store rows come first in
    /// permanent-id order, followed by local-only matches in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Fetch`](crate::CoreError) if the engine cannot answer.
    #[track_caller]
    pub fn fetch(self: &Arc<Self>, request: &FetchRequest) -> CoreResult<Vec<Record>> {
        self.bindings.check_access(self, &request.entity, false);
        let _gate = self.read_gate();

        let unlimited = FetchRequest {
            limit: None,
            ..request.clone()
        };
        let rows = self.engine.fetch(&unlimited)?;
        let rows = match &self.unmerged {
            Some(unmerged) => unmerged.roll_back(rows, &unlimited),
            None => rows,
        };

        let mut seen = HashSet::with_capacity(rows.len());
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            seen.insert(row.id);
            let resident = self.working.read().resident(row.id).cloned();
            match resident {
                Some(record) => {
                    if Self::matches_locally(&record, request) {
                        out.push(record);
                    }
                }
                None => out.push(self.materialize(row.entity, row.id, row.fields)),
            }
        }

        let local: Vec<Record> = self
            .working
            .read()
            .records
            .values()
            .filter(|r| r.entity() == request.entity)
            .cloned()
            .collect();
        for record in local {
            if record.permanent_id().is_some_and(|id| seen.contains(&id)) {
                continue;
            }
            if Self::matches_locally(&record, request) {
                out.push(record);
            }
        }

        if let Some(limit) = request.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Counts the records `request` would return.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Fetch`](crate::CoreError) if the engine cannot answer.
    #[track_caller]
    pub fn count(self: &Arc<Self>, request: &FetchRequest) -> CoreResult<usize> {
        self.bindings.check_access(self, &request.entity, false);
        let _gate = self.read_gate();
        let any_resident = self
            .working
            .read()
            .records
            .values()
            .any(|r| r.entity() == request.entity);
        if !any_resident {
            let count = self.engine.count(request)?;
            if self.unmerged.as_ref().map_or(true, |u| u.is_empty()) {
                return Ok(count);
            }
        }
        Ok(self.fetch(request)?.len())
    }

    /// Marks `record` for deletion at the next commit.
    ///
    /// A record inserted in this context and never committed is simply
    /// discarded.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread may not write to this context or the
    /// record belongs to another one.
    #[track_caller]
    pub fn delete(&self, record: &Record) {
        self.bindings.check_access(self, record.entity(), true);
        if record.owner_id() != self.id {
            fatal(UsageFault::WrongContext {
                owner: record.owner_id(),
                bound: self.id,
            });
        }
        let mut working = self.working.write();
        let status = record.state().status;
        match status {
            RecordStatus::Inserted => working.remove(record),
            RecordStatus::Deleted => {}
            RecordStatus::Clean | RecordStatus::Updated => {
                record.state_mut().status = RecordStatus::Deleted;
                working.dirty.insert(record.temporary_id());
            }
        }
    }

    /// Returns true if this context holds uncommitted changes.
    #[track_caller]
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.bindings.check_access(self, "", false);
        !self.working.read().dirty.is_empty()
    }

    fn matches_locally(record: &Record, request: &FetchRequest) -> bool {
        let state = record.state();
        state.status != RecordStatus::Deleted
            && request.matches_fields(|field| state.fields.get(field).cloned())
    }

    /// Returns the resident instance for `id`, creating it from `fields` if absent.
    pub(crate) fn materialize(
        self: &Arc<Self>,
        entity: String,
        id: PermanentId,
        fields: BTreeMap<String, Value>,
    ) -> Record {
        let mut working = self.working.write();
        if let Some(existing) = working.resident(id) {
            return existing.clone();
        }
        let record = Record::new(self, entity, Some(id), fields, RecordStatus::Clean);
        working.by_permanent.insert(id, record.temporary_id());
        working
            .records
            .insert(record.temporary_id(), record.clone());
        record
    }

    pub(crate) fn resident(&self, id: PermanentId) -> Option<Record> {
        self.working.read().resident(id).cloned()
    }

    /// Drops the resident instance for `id` and returns it.
    pub(crate) fn evict(&self, id: PermanentId) -> Option<Record> {
        let mut working = self.working.write();
        let record = working.resident(id).cloned()?;
        working.remove(&record);
        Some(record)
    }

    pub(crate) fn bindings(&self) -> &ThreadBindings {
        &self.bindings
    }

    pub(crate) fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read_recursive()
    }

    pub(crate) fn write_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write()
    }

    pub(crate) fn schema_field(&self, entity: &str, field: &str) -> Option<FieldKind> {
        self.engine
            .schema()
            .entity(entity)
            .and_then(|def| def.field_kind(field))
    }

    pub(crate) fn check_field(
        &self,
        entity: &str,
        field: &str,
        value: &Value,
    ) -> Result<(), SchemaError> {
        self.engine.schema().check_field(entity, field, value)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        !self.working.read().dirty.is_empty()
    }

    /// Marks a resident record dirty; records already discarded are ignored.
    pub(crate) fn mark_dirty(&self, record: TemporaryId) {
        let mut working = self.working.write();
        if working.records.contains_key(&record) {
            working.dirty.insert(record);
        }
    }

    /// Records with uncommitted changes, in creation order.
    pub(crate) fn dirty_records(&self) -> Vec<Record> {
        let working = self.working.read();
        working
            .dirty
            .iter()
            .filter_map(|tid| working.records.get(tid).cloned())
            .collect()
    }

    /// Marks a committed delta clean; deleted records leave the working set.
    pub(crate) fn mark_clean(&self, records: &[Record]) {
        let mut working = self.working.write();
        for record in records {
            let deleted = record.state().status == RecordStatus::Deleted;
            if deleted {
                working.remove(record);
            } else {
                let mut state = record.state_mut();
                state.status = RecordStatus::Clean;
                state.changed.clear();
                drop(state);
                working.dirty.remove(&record.temporary_id());
            }
        }
        let WorkingSet { records, dirty, .. } = &mut *working;
        dirty.retain(|tid| records.contains_key(tid));
    }

    /// Asks the engine for permanent ids for every record lacking one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdentityAllocation`](crate::CoreError) if the
    /// engine cannot allocate. Records that already received ids keep them.
    pub(crate) fn obtain_permanent_ids(&self, records: &[Record]) -> CoreResult<()> {
        let mut by_entity: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
        for record in records {
            if record.permanent_id().is_none() {
                by_entity.entry(record.entity()).or_default().push(record);
            }
        }
        for (entity, group) in by_entity {
            let ids = self.engine.allocate_permanent_ids(entity, group.len())?;
            if ids.len() != group.len() {
                return Err(IdentityAllocationError::Unavailable.into());
            }
            let mut working = self.working.write();
            for (record, id) in group.into_iter().zip(ids) {
                record.state_mut().permanent_id = Some(id);
                if working.records.contains_key(&record.temporary_id()) {
                    working.by_permanent.insert(id, record.temporary_id());
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ContextNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let working = self.working.read();
        f.debug_struct("ContextNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parent", &self.parent_id())
            .field("resident", &working.records.len())
            .field("dirty", &working.dirty.len())
            .finish()
    }
}
