//! Write transactions.
//!
//! A transaction owns one write context for its whole life:
//!
//! `Created → Bound → Running → (Committing | Cancelling) → Closed`
//!
//! - **Created**: write context allocated under the root
//! - **Bound**: the executing thread is attached to it
//! - **Running**: the body runs; it may commit mid-flight, cancel the
//!   implicit commit, or start nested transactions
//! - **Committing**: the implicit commit, unless cancelled or the body failed
//! - **Cancelling**: nothing is committed; local changes are discarded
//! - **Closed**: thread detached, write context destroyed

mod runner;
mod state;

pub(crate) use runner::TransactionRunner;
pub use runner::PendingTransaction;
pub use state::{Transaction, TransactionOptions, TransactionState};
