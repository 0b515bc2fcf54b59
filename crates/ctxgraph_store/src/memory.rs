//! In-memory store for testing.

use crate::change::{ChangeSet, StoredRow};
use crate::engine::{select, StoreEngine};
use crate::error::{FetchError, IdentityAllocationError, PersistenceError};
use crate::id::PermanentId;
use crate::request::FetchRequest;
use crate::schema::Schema;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An in-memory store.
///
/// Suitable for:
/// - Unit and integration tests
/// - Ephemeral object graphs that don't need persistence
///
/// The failure hooks ([`fail_next_save`](Self::fail_next_save),
/// [`fail_next_allocation`](Self::fail_next_allocation),
/// [`set_unavailable`](Self::set_unavailable)) let tests simulate storage
/// faults without touching a disk.
#[derive(Debug)]
pub struct MemoryStore {
    schema: Schema,
    rows: RwLock<BTreeMap<PermanentId, StoredRow>>,
    saves: AtomicU64,
    fail_save: AtomicBool,
    fail_allocation: AtomicBool,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            rows: RwLock::new(BTreeMap::new()),
            saves: AtomicU64::new(0),
            fail_save: AtomicBool::new(false),
            fail_allocation: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes the next `save` fail with [`PersistenceError::Rejected`].
    pub fn fail_next_save(&self) {
        self.fail_save.store(true, Ordering::SeqCst);
    }

    /// Makes the next identity allocation fail.
    pub fn fail_next_allocation(&self) {
        self.fail_allocation.store(true, Ordering::SeqCst);
    }

    /// Marks the whole store unavailable (or available again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if no rows are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }
}

impl StoreEngine for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn save(&self, changes: &ChangeSet) -> Result<(), PersistenceError> {
        if self.is_unavailable() {
            return Err(PersistenceError::rejected("store unavailable"));
        }
        if self.fail_save.swap(false, Ordering::SeqCst) {
            return Err(PersistenceError::rejected("injected save failure"));
        }
        changes.apply_to(&mut self.rows.write(), &self.schema)?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allocate_permanent_ids(
        &self,
        entity: &str,
        count: usize,
    ) -> Result<Vec<PermanentId>, IdentityAllocationError> {
        if self.is_unavailable() || self.fail_allocation.swap(false, Ordering::SeqCst) {
            return Err(IdentityAllocationError::Unavailable);
        }
        if !self.schema.contains(entity) {
            return Err(IdentityAllocationError::UnknownEntity {
                entity: entity.to_string(),
            });
        }
        Ok((0..count).map(|_| PermanentId::generate()).collect())
    }

    fn fetch(&self, request: &FetchRequest) -> Result<Vec<StoredRow>, FetchError> {
        if self.is_unavailable() {
            return Err(FetchError::Unavailable);
        }
        select(&self.rows.read(), &self.schema, request)
    }

    fn load(&self, id: PermanentId) -> Result<Option<StoredRow>, FetchError> {
        if self.is_unavailable() {
            return Err(FetchError::Unavailable);
        }
        Ok(self.rows.read().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::RowChange;
    use crate::schema::{EntityDef, FieldKind};
    use crate::value::Value;

    fn store() -> MemoryStore {
        MemoryStore::new(
            Schema::new().with_entity(EntityDef::new("Page").field("visits", FieldKind::Integer)),
        )
    }

    fn insert(store: &MemoryStore, visits: i64) -> PermanentId {
        let id = store.allocate_permanent_ids("Page", 1).unwrap()[0];
        let mut row = StoredRow::new(id, "Page");
        row.fields.insert("visits".into(), Value::Integer(visits));
        store
            .save(&ChangeSet::from(vec![RowChange::Insert { row }]))
            .unwrap();
        id
    }

    #[test]
    fn save_and_load() {
        let store = store();
        let id = insert(&store, 5);
        let row = store.load(id).unwrap().unwrap();
        assert_eq!(row.get("visits"), Some(&Value::Integer(5)));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn injected_save_failure_is_one_shot() {
        let store = store();
        store.fail_next_save();
        let id = PermanentId::generate();
        let change = ChangeSet::from(vec![RowChange::Insert {
            row: StoredRow::new(id, "Page"),
        }]);
        assert!(matches!(
            store.save(&change),
            Err(PersistenceError::Rejected { .. })
        ));
        assert!(store.is_empty());
        store.save(&change).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn injected_allocation_failure() {
        let store = store();
        store.fail_next_allocation();
        assert!(store.allocate_permanent_ids("Page", 2).is_err());
        assert_eq!(store.allocate_permanent_ids("Page", 2).unwrap().len(), 2);
    }

    #[test]
    fn unknown_entity_allocation_fails() {
        assert!(matches!(
            store().allocate_permanent_ids("Nope", 1),
            Err(IdentityAllocationError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn unavailable_store_rejects_everything() {
        let store = store();
        let id = insert(&store, 1);
        store.set_unavailable(true);
        assert!(store.load(id).is_err());
        assert!(store.fetch(&FetchRequest::new("Page")).is_err());
        assert!(store.save(&ChangeSet::new()).is_err());
        store.set_unavailable(false);
        assert!(store.load(id).unwrap().is_some());
    }

    #[test]
    fn fetch_filters_and_counts() {
        let store = store();
        insert(&store, 1);
        insert(&store, 2);
        insert(&store, 2);
        let request = FetchRequest::new("Page").equals("visits", 2);
        assert_eq!(store.fetch(&request).unwrap().len(), 2);
        assert_eq!(store.count(&request).unwrap(), 2);
        assert_eq!(store.count(&request.limit(1)).unwrap(), 1);
    }

    #[test]
    fn fetch_unknown_entity_fails() {
        assert!(matches!(
            store().fetch(&FetchRequest::new("Nope")),
            Err(FetchError::UnknownEntity { .. })
        ));
    }
}
