//! # ctxgraph Store
//!
//! Storage engine trait and implementations for ctxgraph.
//!
//! This crate is the persistence collaborator of the context tree. The core
//! never touches disk itself; it hands committed change sets to a
//! [`StoreEngine`] and reads rows back through it.
//!
//! ## Design Principles
//!
//! - Engines persist whole [`ChangeSet`]s atomically
//! - Engines assign [`PermanentId`]s; the core never invents them
//! - Engines must be `Send + Sync` for concurrent access
//! - Engines know the [`Schema`] and reject rows that violate it
//!
//! ## Available Engines
//!
//! - [`MemoryStore`] - For testing and ephemeral stores, with failure injection
//! - [`FileStore`] - Append-only commit log in a locked directory
//!
//! ## Example
//!
//! ```rust
//! use ctxgraph_store::{
//!     ChangeSet, EntityDef, FieldKind, MemoryStore, RowChange, Schema, StoreEngine, StoredRow,
//!     Value,
//! };
//!
//! let schema = Schema::new().with_entity(EntityDef::new("Counter").field("visits", FieldKind::Integer));
//! let store = MemoryStore::new(schema);
//! let id = store.allocate_permanent_ids("Counter", 1).unwrap()[0];
//!
//! let mut row = StoredRow::new(id, "Counter");
//! row.fields.insert("visits".into(), Value::Integer(5));
//! store.save(&ChangeSet::from(vec![RowChange::Insert { row }])).unwrap();
//!
//! assert_eq!(store.load(id).unwrap().unwrap().get("visits"), Some(&Value::Integer(5)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod engine;
mod error;
mod file;
mod id;
mod memory;
mod request;
mod schema;
mod value;

pub use change::{ChangeSet, RowChange, StoredRow};
pub use engine::{open_store, StoreEngine, StoreLocation};
pub use error::{FetchError, IdentityAllocationError, PersistenceError, StoreError, StoreResult};
pub use file::{CommitFrame, FileStore, LogScan, LOG_MAGIC, LOG_VERSION};
pub use id::PermanentId;
pub use memory::MemoryStore;
pub use request::{FetchRequest, Predicate};
pub use schema::{EntityDef, FieldKind, Schema, SchemaError};
pub use value::Value;
