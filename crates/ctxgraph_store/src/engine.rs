//! Storage engine trait definition.

use crate::change::{ChangeSet, StoredRow};
use crate::error::{FetchError, IdentityAllocationError, PersistenceError, StoreResult};
use crate::file::FileStore;
use crate::id::PermanentId;
use crate::memory::MemoryStore;
use crate::request::FetchRequest;
use crate::schema::Schema;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A persistent record store.
///
/// Engines are the single authority for persisted rows and permanent
/// identities. The context tree calls [`save`](Self::save) only from its root
/// commit path, one commit at a time.
///
/// # Invariants
///
/// - `save` is atomic: every change in the set lands, or none does
/// - `allocate_permanent_ids` never returns an id that is already in use
/// - `fetch` returns rows ordered by permanent id
/// - Engines must be `Send + Sync` for concurrent access
pub trait StoreEngine: Send + Sync {
    /// The schema this store enforces.
    fn schema(&self) -> &Schema;

    /// Persists a change set.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if a constraint is violated or the
    /// write fails. The store is unchanged in that case.
    fn save(&self, changes: &ChangeSet) -> Result<(), PersistenceError>;

    /// Assigns `count` fresh identities for records of `entity`.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityAllocationError`] if the store cannot allocate.
    fn allocate_permanent_ids(
        &self,
        entity: &str,
        count: usize,
    ) -> Result<Vec<PermanentId>, IdentityAllocationError>;

    /// Reads the rows matching `request`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] for unknown entities or an unavailable store.
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<StoredRow>, FetchError>;

    /// Counts the rows matching `request`.
    ///
    /// # Errors
    ///
    /// Same as [`fetch`](Self::fetch).
    fn count(&self, request: &FetchRequest) -> Result<usize, FetchError> {
        Ok(self.fetch(request)?.len())
    }

    /// Reads one row by identity.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] if the store is unavailable.
    fn load(&self, id: PermanentId) -> Result<Option<StoredRow>, FetchError>;
}

/// Where a store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Nothing survives the process.
    InMemory,
    /// A directory holding the lock file and commit log.
    Directory(PathBuf),
}

/// Opens a store for `schema` at `location`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, is locked by another
/// process, or holds a corrupted commit log.
pub fn open_store(schema: Schema, location: StoreLocation) -> StoreResult<Arc<dyn StoreEngine>> {
    match location {
        StoreLocation::InMemory => Ok(Arc::new(MemoryStore::new(schema))),
        StoreLocation::Directory(path) => Ok(Arc::new(FileStore::open(schema, &path)?)),
    }
}

/// Evaluates a request over an id-ordered row map.
pub(crate) fn select(
    rows: &BTreeMap<PermanentId, StoredRow>,
    schema: &Schema,
    request: &FetchRequest,
) -> Result<Vec<StoredRow>, FetchError> {
    if !schema.contains(&request.entity) {
        return Err(FetchError::UnknownEntity {
            entity: request.entity.clone(),
        });
    }
    let matching = rows.values().filter(|row| request.matches_row(row)).cloned();
    Ok(match request.limit {
        Some(limit) => matching.take(limit).collect(),
        None => matching.collect(),
    })
}
