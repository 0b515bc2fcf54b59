//! # ctxgraph Core
//!
//! A concurrency-safety layer between application threads and a persistent
//! object store.
//!
//! This crate provides:
//! - A context tree: one root that owns the path to storage, one shared
//!   read-only main context, and a fresh write context per transaction
//! - Thread affinity: every record field access is checked against the
//!   calling thread's bound context, and misuse panics at the offending call
//! - Serialization lanes that order write transactions FIFO
//! - A merge broadcaster that replays committed changes into the main
//!   context and notifies observers once the merge is visible
//!
//! ## Example
//!
//! ```rust,no_run
//! use ctxgraph_core::{Config, Coordinator, TransactionOptions};
//! use ctxgraph_store::{EntityDef, FieldKind, Schema, StoreLocation};
//! use std::sync::Arc;
//!
//! let schema = Schema::new().with_entity(EntityDef::new("Page").field("visits", FieldKind::Integer));
//! let graph = Arc::new(Coordinator::open(schema, StoreLocation::InMemory, Config::default())?);
//!
//! let worker = Arc::clone(&graph);
//! std::thread::spawn(move || {
//!     worker.run_transaction(TransactionOptions::new(), |txn| {
//!         let page = txn.context().insert("Page");
//!         page.set("visits", 1);
//!         Ok(())
//!     })
//! })
//! .join()
//! .unwrap()?;
//!
//! graph.wait_for_merges();
//! # Ok::<(), ctxgraph_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod binding;
mod config;
mod context;
mod coordinator;
mod error;
mod lane;
mod merge;
mod record;
mod stats;
mod transaction;
mod types;

pub use config::Config;
pub use context::{ContextNode, NodeKind};
pub use coordinator::Coordinator;
pub use error::{CoreError, CoreResult, UsageFault};
pub use merge::{MergeEvent, MergeEventKind, SubscriptionId, UpdateHandler};
pub use record::{Record, RecordStatus};
pub use stats::StatsSnapshot;
pub use transaction::{PendingTransaction, Transaction, TransactionOptions, TransactionState};
pub use types::{LaneId, NodeId, SequenceNumber, TemporaryId, TransactionId};

pub use ctxgraph_store::{FetchRequest, PermanentId, Predicate, Value};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
