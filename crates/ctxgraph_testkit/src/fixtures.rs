//! Test fixtures and coordinator helpers.
//!
//! A harness is created on the test thread, which therefore becomes the
//! coordinator's UI thread. Writes have to happen on other threads; use
//! [`on_worker`] for that.

use ctxgraph_core::{Config, Coordinator, PermanentId, TransactionOptions};
use ctxgraph_store::{EntityDef, FieldKind, MemoryStore, Schema, StoreLocation};
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

/// Schema used throughout the test suite.
///
/// - `Page { visits: Integer, title: Text, parent: Reference }`
/// - `Tag { name: Text, page: Reference }`
pub fn page_schema() -> Schema {
    Schema::new()
        .with_entity(
            EntityDef::new("Page")
                .field("visits", FieldKind::Integer)
                .field("title", FieldKind::Text)
                .field("parent", FieldKind::Reference),
        )
        .with_entity(
            EntityDef::new("Tag")
                .field("name", FieldKind::Text)
                .field("page", FieldKind::Reference),
        )
}

/// A coordinator with automatic cleanup.
pub struct TestHarness {
    /// The coordinator, shareable with worker threads.
    pub coordinator: Arc<Coordinator>,
    store: Option<Arc<MemoryStore>>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestHarness {
    /// Creates a harness over an in-memory store.
    pub fn memory() -> Self {
        Self::memory_with(Config::default())
    }

    /// Creates a harness over an in-memory store with `config`.
    pub fn memory_with(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new(page_schema()));
        let coordinator =
            Coordinator::with_engine(store.clone(), config).expect("Failed to open coordinator");
        Self {
            coordinator: Arc::new(coordinator),
            store: Some(store),
            temp_dir: None,
        }
    }

    /// Creates a harness over a file store in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let coordinator = Coordinator::open(
            page_schema(),
            StoreLocation::Directory(temp_dir.path().to_path_buf()),
            Config::default(),
        )
        .expect("Failed to open file store");
        Self {
            coordinator: Arc::new(coordinator),
            store: None,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the in-memory store, for fault injection.
    ///
    /// # Panics
    ///
    /// Panics for file-backed harnesses.
    pub fn store(&self) -> &MemoryStore {
        self.store
            .as_deref()
            .expect("harness is not backed by a memory store")
    }

    /// Returns the store directory if file-based.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }
}

impl std::ops::Deref for TestHarness {
    type Target = Arc<Coordinator>;

    fn deref(&self) -> &Self::Target {
        &self.coordinator
    }
}

/// Runs `f` on a fresh worker thread and returns its result.
///
/// A panic on the worker is resumed on the caller.
pub fn on_worker<T, F>(graph: &Arc<Coordinator>, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&Coordinator) -> T + Send + 'static,
{
    let graph = Arc::clone(graph);
    match thread::spawn(move || f(&graph)).join() {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

/// Runs `f` on a worker thread that is expected to panic and returns the
/// panic message.
///
/// # Panics
///
/// Panics if `f` returns normally.
pub fn expect_fault<F>(graph: &Arc<Coordinator>, f: F) -> String
where
    F: FnOnce(&Coordinator) + Send + 'static,
{
    let graph = Arc::clone(graph);
    match thread::spawn(move || f(&graph)).join() {
        Ok(()) => panic!("expected a usage fault"),
        Err(payload) => panic_message(payload.as_ref()),
    }
}

/// Extracts the message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        String::new()
    }
}

/// Commits a new `Page` with `visits` from a worker thread and returns its id.
pub fn seed_page(graph: &Arc<Coordinator>, visits: i64) -> PermanentId {
    on_worker(graph, move |g| {
        let page = g
            .run_transaction(TransactionOptions::new(), |txn| {
                let page = txn.context().insert("Page");
                page.set("visits", visits);
                Ok(page)
            })
            .expect("Failed to seed page");
        page.permanent_id().expect("committed page has an id")
    })
}

/// Adds `delta` to a page's `visits` in one transaction on the calling thread.
///
/// # Errors
///
/// Returns the transaction's error.
pub fn increment_visits(
    graph: &Coordinator,
    options: TransactionOptions,
    id: PermanentId,
    delta: i64,
) -> ctxgraph_core::CoreResult<()> {
    graph.run_transaction(options, |txn| {
        if let Some(page) = txn.context().object(id)? {
            let visits = page.get("visits").as_integer().unwrap_or(0);
            page.set("visits", visits + delta);
        }
        Ok(())
    })
}
