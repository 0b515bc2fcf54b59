//! Error types for the context tree.
//!
//! There are two taxonomies. [`CoreError`] covers operational failures that
//! originate in the storage engine; they are returned to the caller, who
//! decides whether to retry. [`UsageFault`] covers programmer errors such as
//! touching a record from the wrong thread; those are never returned, they
//! are raised through [`fatal`] at the offending call.

use crate::types::{NodeId, TransactionId};
use ctxgraph_store::{FetchError, IdentityAllocationError, PersistenceError, StoreError};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Recoverable errors surfaced by commit, fetch and lifecycle calls.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The storage engine rejected a save.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// The storage engine could not assign permanent ids.
    #[error("identity allocation error: {0}")]
    IdentityAllocation(#[from] IdentityAllocationError),

    /// The storage engine could not answer a read.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// The store could not be opened.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The coordinator has been closed.
    #[error("coordinator is closed")]
    Closed,

    /// The transaction body gave up and nothing was committed.
    #[error("transaction {id} aborted: {reason}")]
    TransactionAborted {
        /// The aborted transaction.
        id: TransactionId,
        /// Reason given by the body.
        reason: String,
    },

    /// A transaction thread could not be started.
    #[error("failed to spawn transaction thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

impl CoreError {
    /// Creates an abort error for use as a transaction body's result.
    pub fn aborted(id: TransactionId, reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            id,
            reason: reason.into(),
        }
    }
}

/// A violation of the thread/context affinity rules.
///
/// Faults indicate a logic bug in the caller and are raised as panics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageFault {
    /// The calling thread has no context attached.
    #[error("no context bound to thread {thread}")]
    NoContextBound {
        /// Debug rendering of the thread id.
        thread: String,
    },

    /// The calling thread is bound to a different context than the record's.
    #[error("wrong context: record belongs to {owner}, thread is bound to {bound}")]
    WrongContext {
        /// Owner of the record.
        owner: NodeId,
        /// Context bound to the thread.
        bound: NodeId,
    },

    /// A write from the main read context or the UI thread.
    #[error("main thread write: {entity} records in {node} are read-only")]
    MainThreadWrite {
        /// Entity of the record.
        entity: String,
        /// Owner of the record.
        node: NodeId,
    },

    /// Two records from different contexts were linked.
    #[error("cross-context relationship: {field} links {from} to {to}")]
    CrossContextRelationship {
        /// Field being assigned.
        field: String,
        /// Context of the source record.
        from: NodeId,
        /// Context of the target record.
        to: NodeId,
    },

    /// A synchronous transaction was started on the UI thread.
    #[error("main thread transaction: synchronous transactions cannot run on the UI thread")]
    MainThreadTransaction,

    /// A write outside any active transaction.
    #[error("not in transaction: writes to {node} require an active transaction")]
    NotInTransaction {
        /// Owner of the record.
        node: NodeId,
    },

    /// The record outlived the context that owned it.
    #[error("destroyed context: {node} no longer exists")]
    DestroyedContext {
        /// The destroyed context.
        node: NodeId,
    },

    /// A field value the schema does not allow.
    #[error("schema violation: {message}")]
    SchemaViolation {
        /// Description from the schema check.
        message: String,
    },

    /// An update handler was attached to a record outside the main context.
    #[error("not main context: update handlers attach only to main-context records, not {node}")]
    NotMainContext {
        /// Owner of the record.
        node: NodeId,
    },
}

/// Raises a usage fault.
///
/// The fault is logged and then the calling thread panics with the fault's
/// message.
#[cold]
#[track_caller]
pub(crate) fn fatal(fault: UsageFault) -> ! {
    tracing::error!(%fault, "usage fault");
    panic!("{fault}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_error_converts() {
        let err: CoreError = PersistenceError::rejected("disk full").into();
        assert!(matches!(err, CoreError::Persistence(_)));
        assert_eq!(err.to_string(), "persistence error: save rejected: disk full");
    }

    #[test]
    fn fault_messages_name_the_fault() {
        let fault = UsageFault::MainThreadWrite {
            entity: "Page".into(),
            node: NodeId::next(),
        };
        assert!(fault.to_string().starts_with("main thread write"));
        assert!(UsageFault::MainThreadTransaction
            .to_string()
            .starts_with("main thread transaction"));
    }

    #[test]
    #[should_panic(expected = "not in transaction")]
    fn fatal_panics_with_message() {
        fatal(UsageFault::NotInTransaction {
            node: NodeId::next(),
        });
    }
}
