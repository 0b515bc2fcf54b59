//! Transaction handles and options.

use crate::context::{ContextNode, ContextTree};
use crate::error::{fatal, CoreResult, UsageFault};
use crate::record::Record;
use crate::types::{LaneId, SequenceNumber, TransactionId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Write context allocated, no thread attached yet.
    Created,
    /// Executing thread attached.
    Bound,
    /// Body is running.
    Running,
    /// Implicit commit in progress.
    Committing,
    /// Ending without the implicit commit.
    Cancelling,
    /// Finished. Terminal.
    Closed,
}

/// Per-call scheduling options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Join the lane; `None` uses the coordinator's default.
    pub serial: Option<bool>,
    /// Lane to join; `None` uses the coordinator's default lane.
    pub lane: Option<LaneId>,
}

impl TransactionOptions {
    /// Creates options that defer to the coordinator's configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the transaction waits its turn in a lane.
    #[must_use]
    pub fn serial(mut self, serial: bool) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Sets the lane.
    #[must_use]
    pub fn lane(mut self, lane: impl Into<LaneId>) -> Self {
        self.lane = Some(lane.into());
        self
    }
}

/// Handle passed to a transaction body.
///
/// All methods must be called from the thread running the body.
pub struct Transaction {
    id: TransactionId,
    node: Arc<ContextNode>,
    lane: Option<LaneId>,
    state: Mutex<TransactionState>,
    tree: Arc<ContextTree>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        node: Arc<ContextNode>,
        lane: Option<LaneId>,
        tree: Arc<ContextTree>,
    ) -> Self {
        Self {
            id,
            node,
            lane,
            state: Mutex::new(TransactionState::Created),
            tree,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the transaction's write context.
    #[must_use]
    pub fn context(&self) -> &Arc<ContextNode> {
        &self.node
    }

    /// Returns the lane this transaction was serialized on, if any.
    #[must_use]
    pub fn lane(&self) -> Option<&LaneId> {
        self.lane.as_ref()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Commits the changes made so far and keeps running.
    ///
    /// Returns the commit's sequence, or `None` if there was nothing to
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns the storage engine's error; the write context keeps its
    /// changes so the commit can be retried.
    #[track_caller]
    pub fn commit(&self) -> CoreResult<Option<SequenceNumber>> {
        self.tree.bindings().check_access(&self.node, "", false);
        self.tree.commit(&self.node)
    }

    /// Skips the implicit commit at the end of the body.
    #[track_caller]
    pub fn cancel_implicit_commit(&self) {
        let bindings = self.tree.bindings();
        bindings.check_access(&self.node, "", false);
        if !bindings.suppress_implicit_commit(self.node.id()) {
            fatal(UsageFault::NotInTransaction { node: self.node.id() });
        }
    }

    /// Assigns permanent ids to `records` ahead of the commit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdentityAllocation`](crate::CoreError) if the
    /// engine cannot allocate.
    ///
    /// # Panics
    ///
    /// Panics if a record belongs to another context.
    #[track_caller]
    pub fn obtain_permanent_ids(&self, records: &[Record]) -> CoreResult<()> {
        let bindings = self.tree.bindings();
        bindings.check_access(&self.node, "", false);
        for record in records {
            bindings.check_relationship("permanent id", self.node.id(), record.owner_id());
        }
        self.node.obtain_permanent_ids(records)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("node", &self.node.id())
            .field("lane", &self.lane)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_config() {
        let options = TransactionOptions::new();
        assert_eq!(options.serial, None);
        assert_eq!(options.lane, None);
    }

    #[test]
    fn options_builder() {
        let options = TransactionOptions::new().serial(false).lane("imports");
        assert_eq!(options.serial, Some(false));
        assert_eq!(options.lane, Some(LaneId::new("imports")));
    }
}
