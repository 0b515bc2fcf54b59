//! Error types for store operations.

use crate::schema::SchemaError;
use std::io;
use thiserror::Error;

/// Result type for opening and inspecting stores.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while opening or reading a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the store's lock file.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The commit log is corrupted.
    #[error("store corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The location cannot hold a store.
    #[error("invalid store location: {message}")]
    InvalidLocation {
        /// Why the location was rejected.
        message: String,
    },
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates an invalid location error.
    pub fn invalid_location(message: impl Into<String>) -> Self {
        Self::InvalidLocation {
            message: message.into(),
        }
    }
}

/// The engine rejected a save.
///
/// A failed save leaves the store exactly as it was before the call.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// A constraint was violated (missing row, duplicate id, schema mismatch).
    #[error("constraint violation: {message}")]
    Constraint {
        /// Description of the violated constraint.
        message: String,
    },

    /// The row does not conform to the schema.
    #[error("schema violation: {0}")]
    Schema(#[from] SchemaError),

    /// Writing the commit failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The change set could not be encoded.
    #[error("encoding failed: {message}")]
    Encode {
        /// Encoder message.
        message: String,
    },

    /// The engine refused the write for an external reason.
    #[error("save rejected: {message}")]
    Rejected {
        /// Reason given by the engine.
        message: String,
    },
}

impl PersistenceError {
    /// Creates a constraint violation.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    /// Creates a rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// The engine could not assign permanent identities.
#[derive(Debug, Error)]
pub enum IdentityAllocationError {
    /// The store is not available.
    #[error("store unavailable")]
    Unavailable,

    /// The entity is not part of the schema.
    #[error("unknown entity: {entity}")]
    UnknownEntity {
        /// The requested entity name.
        entity: String,
    },
}

/// A fetch could not be executed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The store is not available.
    #[error("store unavailable")]
    Unavailable,

    /// The request names an entity the schema does not know.
    #[error("unknown entity: {entity}")]
    UnknownEntity {
        /// The requested entity name.
        entity: String,
    },
}
