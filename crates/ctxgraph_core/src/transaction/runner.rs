//! Transaction orchestration.

use super::state::{Transaction, TransactionOptions, TransactionState};
use crate::config::Config;
use crate::context::ContextTree;
use crate::error::{fatal, CoreError, CoreResult, UsageFault};
use crate::lane::{SerializationQueue, Ticket};
use crate::stats::CoordinatorStats;
use crate::types::{LaneId, TransactionId};
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Runs transaction bodies against fresh write contexts.
pub(crate) struct TransactionRunner {
    tree: Arc<ContextTree>,
    queue: SerializationQueue,
    next_txid: AtomicU64,
    config: Config,
    stats: Arc<CoordinatorStats>,
}

impl TransactionRunner {
    pub(crate) fn new(tree: Arc<ContextTree>, config: Config, stats: Arc<CoordinatorStats>) -> Self {
        Self {
            tree,
            queue: SerializationQueue::new(),
            next_txid: AtomicU64::new(1),
            config,
            stats,
        }
    }

    /// Runs `body` on the calling thread and waits for it to close.
    ///
    /// # Panics
    ///
    /// Panics when called on the UI thread.
    #[track_caller]
    pub(crate) fn run<T, F>(&self, options: &TransactionOptions, body: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        if self.tree.bindings().is_main_thread() {
            fatal(UsageFault::MainThreadTransaction);
        }
        let (lane, ticket) = self.schedule(options);
        let _turn = ticket.map(Ticket::wait);
        self.execute(lane, body)
    }

    /// Runs `body` on a new thread and returns immediately.
    ///
    /// The lane place is taken now, so transactions submitted from one thread
    /// start in submission order.
    pub(crate) fn spawn<T, F>(
        self: &Arc<Self>,
        options: &TransactionOptions,
        body: F,
    ) -> CoreResult<PendingTransaction<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction) -> CoreResult<T> + Send + 'static,
    {
        let (lane, ticket) = self.schedule(options);
        let runner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-txn", self.config.thread_name_prefix))
            .spawn(move || {
                let _turn = ticket.map(Ticket::wait);
                runner.execute(lane, body)
            })
            .map_err(CoreError::ThreadSpawn)?;
        Ok(PendingTransaction { handle })
    }

    /// Resolves the lane discipline for a new transaction.
    ///
    /// Transactions started from inside a transaction never wait on a lane.
    fn schedule(&self, options: &TransactionOptions) -> (Option<LaneId>, Option<Ticket>) {
        if self.tree.bindings().inside_transaction() {
            return (None, None);
        }
        let serial = options.serial.unwrap_or(self.config.serial_by_default);
        if !serial {
            return (None, None);
        }
        let lane = options
            .lane
            .clone()
            .unwrap_or_else(|| self.config.default_lane.clone());
        let ticket = self.queue.enqueue(&lane);
        (Some(lane), Some(ticket))
    }

    fn execute<T, F>(&self, lane: Option<LaneId>, body: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let node = self.tree.create_write_node();
        let txn = Transaction::new(id, Arc::clone(&node), lane, Arc::clone(&self.tree));
        debug!(txn = %id, node = %node.id(), lane = ?txn.lane(), "transaction created");

        let binding = self.tree.bindings().bind(Arc::clone(&node), true);
        txn.set_state(TransactionState::Bound);
        self.stats.record_transaction_start();
        debug!(txn = %id, "transaction bound");

        txn.set_state(TransactionState::Running);
        let outcome = body(&txn);

        let result = match outcome {
            Err(err) => {
                txn.set_state(TransactionState::Cancelling);
                self.stats.record_transaction_cancel();
                debug!(txn = %id, error = %err, "body failed; implicit commit skipped");
                Err(err)
            }
            Ok(value) if self.tree.bindings().is_commit_suppressed(node.id()) => {
                txn.set_state(TransactionState::Cancelling);
                self.stats.record_transaction_cancel();
                debug!(txn = %id, "implicit commit cancelled");
                Ok(value)
            }
            Ok(value) => {
                txn.set_state(TransactionState::Committing);
                self.tree.commit(&node).map(|_| value)
            }
        };

        drop(binding);
        txn.set_state(TransactionState::Closed);
        debug!(txn = %id, ok = result.is_ok(), "transaction closed");
        result
    }
}

/// A transaction running on its own thread.
#[derive(Debug)]
pub struct PendingTransaction<T> {
    handle: JoinHandle<CoreResult<T>>,
}

impl<T> PendingTransaction<T> {
    /// Returns true once the transaction has closed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the transaction closes and returns its result.
    ///
    /// A panic in the body, including a usage fault, is resumed on the
    /// waiting thread.
    ///
    /// # Errors
    ///
    /// Returns whatever the body or its commit returned.
    pub fn wait(self) -> CoreResult<T> {
        match self.handle.join() {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
