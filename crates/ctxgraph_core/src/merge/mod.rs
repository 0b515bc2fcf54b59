//! Propagation of committed deltas into the main read context.
//!
//! The root publishes one [`MergeBatch`] per persisted commit, in sequence
//! order, onto a channel drained by a dedicated broadcaster thread. For each
//! batch the broadcaster:
//!
//! 1. Takes the main context's merge gate exclusively, so no reader can see
//!    a half-applied batch.
//! 2. Faults in the pre-merge version of every updated record that is not
//!    yet resident, then applies inserts, updates and deletes.
//! 3. Withdraws the batch from the unmerged registry, which until then kept
//!    main-context store reads at their pre-commit versions.
//! 4. Releases the gate and dispatches exactly one event per affected
//!    record, first to per-record handlers and then to the global feed.
//!
//! A batch arriving while the previous one is still dispatching waits in the
//! channel, so notifications of one commit always finish before the next
//! commit is applied.

mod event;
mod feed;
mod pending;

pub use event::{MergeEvent, MergeEventKind};
pub(crate) use pending::UnmergedCommits;

use crate::binding::ThreadBindings;
use crate::config::Config;
use crate::context::ContextNode;
use crate::error::{CoreError, CoreResult};
use crate::record::RecordStatus;
use crate::stats::CoordinatorStats;
use crate::types::SequenceNumber;
use ctxgraph_store::{PermanentId, StoredRow, Value};
use feed::MergeFeed;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, trace, warn};

/// Callback invoked with each merge event for one main-context record.
pub type UpdateHandler = Arc<dyn Fn(&MergeEvent) + Send + Sync>;

/// Handle returned by [`Coordinator::attach_update_handler`](crate::Coordinator::attach_update_handler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One record's change within a persisted commit.
#[derive(Debug, Clone)]
pub(crate) struct MergedChange {
    pub(crate) id: PermanentId,
    pub(crate) entity: String,
    /// Committed fields before the commit; `None` for inserts.
    pub(crate) before: Option<BTreeMap<String, Value>>,
    /// Committed fields after the commit; `None` for deletes.
    pub(crate) after: Option<BTreeMap<String, Value>>,
    pub(crate) changed: BTreeSet<String>,
}

impl MergedChange {
    /// The row as it was before the commit.
    pub(crate) fn before_row(&self) -> Option<StoredRow> {
        self.before.as_ref().map(|fields| StoredRow {
            id: self.id,
            entity: self.entity.clone(),
            fields: fields.clone(),
        })
    }
}

/// Everything one commit changed, tagged with its sequence.
#[derive(Debug)]
pub(crate) struct MergeBatch {
    pub(crate) sequence: SequenceNumber,
    pub(crate) changes: Vec<MergedChange>,
}

type HandlerList = Vec<(SubscriptionId, UpdateHandler)>;

struct Shared {
    main: Arc<ContextNode>,
    handlers: RwLock<HashMap<PermanentId, HandlerList>>,
    feed: MergeFeed,
    unmerged: Arc<UnmergedCommits>,
    merged: Mutex<u64>,
    merged_changed: Condvar,
    stats: Arc<CoordinatorStats>,
}

impl Shared {
    fn apply(&self, batch: MergeBatch) {
        let sequence = batch.sequence;
        let mut events = Vec::with_capacity(batch.changes.len());
        {
            let _gate = self.main.write_gate();
            for change in batch.changes {
                let kind = self.apply_change(&change);
                trace!(%sequence, id = %change.id, ?kind, "merged record");
                events.push(MergeEvent {
                    sequence,
                    id: change.id,
                    entity: change.entity,
                    kind,
                    changed_fields: change.changed.into_iter().collect(),
                    fields: change.after,
                });
            }
            self.unmerged.withdraw(sequence);
        }

        for event in &events {
            self.notify_handlers(event);
        }
        self.feed.emit_batch(&events);
        self.stats.record_merge(events.len() as u64);
        debug!(%sequence, events = events.len(), "merge dispatched");
        self.finish(sequence);
    }

    fn apply_change(&self, change: &MergedChange) -> MergeEventKind {
        let Some(after) = &change.after else {
            if let Some(record) = self.main.evict(change.id) {
                record.state_mut().status = RecordStatus::Deleted;
            }
            return MergeEventKind::Deleted;
        };
        if let Some(record) = self.main.resident(change.id) {
            record.state_mut().fields.clone_from(after);
            return MergeEventKind::Updated;
        }
        match &change.before {
            Some(before) => {
                let record =
                    self.main
                        .materialize(change.entity.clone(), change.id, before.clone());
                record.state_mut().fields.clone_from(after);
                MergeEventKind::Refreshed
            }
            None => {
                self.main
                    .materialize(change.entity.clone(), change.id, after.clone());
                MergeEventKind::Inserted
            }
        }
    }

    fn notify_handlers(&self, event: &MergeEvent) {
        let handlers: Vec<UpdateHandler> = self
            .handlers
            .read()
            .get(&event.id)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(id = %event.id, sequence = %event.sequence, "update handler panicked");
            }
        }
        if event.kind == MergeEventKind::Deleted {
            self.handlers.write().remove(&event.id);
        }
    }

    fn finish(&self, sequence: SequenceNumber) {
        let mut merged = self.merged.lock();
        if sequence.as_u64() > *merged {
            *merged = sequence.as_u64();
        }
        self.merged_changed.notify_all();
    }
}

/// Owner of the broadcaster thread.
pub(crate) struct MergeBroadcaster {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<MergeBatch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
    published: AtomicU64,
    next_subscription: AtomicU64,
}

impl MergeBroadcaster {
    /// Spawns the broadcaster thread, bound to `main`.
    pub(crate) fn start(
        main: Arc<ContextNode>,
        bindings: Arc<ThreadBindings>,
        unmerged: Arc<UnmergedCommits>,
        config: &Config,
        stats: Arc<CoordinatorStats>,
    ) -> CoreResult<Self> {
        let shared = Arc::new(Shared {
            main,
            handlers: RwLock::new(HashMap::new()),
            feed: MergeFeed::with_max_history(config.merge_history),
            unmerged,
            merged: Mutex::new(0),
            merged_changed: Condvar::new(),
            stats,
        });
        let (tx, rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("{}-merge", config.thread_name_prefix))
            .spawn(move || run(&worker_shared, &bindings, &rx))
            .map_err(CoreError::ThreadSpawn)?;

        Ok(Self {
            shared,
            sender: Mutex::new(Some(tx)),
            worker_thread: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            published: AtomicU64::new(0),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Queues a persisted commit for merging.
    ///
    /// Callers publish in sequence order.
    pub(crate) fn publish(&self, batch: MergeBatch) {
        let sequence = batch.sequence;
        self.published.fetch_max(sequence.as_u64(), Ordering::AcqRel);
        let sent = match self.sender.lock().as_ref() {
            Some(tx) => tx.send(batch).is_ok(),
            None => false,
        };
        if !sent {
            warn!(%sequence, "merge broadcaster stopped; commit not merged");
            self.shared.unmerged.withdraw(sequence);
            self.shared.finish(sequence);
        }
    }

    /// Blocks until every commit published so far has been dispatched.
    ///
    /// Returns immediately on the broadcaster thread itself.
    pub(crate) fn wait_for_merges(&self) {
        if thread::current().id() == self.worker_thread {
            return;
        }
        let target = self.published.load(Ordering::Acquire);
        let mut merged = self.shared.merged.lock();
        while *merged < target {
            self.shared.merged_changed.wait(&mut merged);
        }
    }

    /// Returns the sequence of the last dispatched commit.
    pub(crate) fn merged_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(*self.shared.merged.lock())
    }

    pub(crate) fn attach(&self, id: PermanentId, handler: UpdateHandler) -> SubscriptionId {
        let subscription = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared
            .handlers
            .write()
            .entry(id)
            .or_default()
            .push((subscription, handler));
        subscription
    }

    /// Removes a handler; returns false if it was not attached.
    pub(crate) fn detach(&self, subscription: SubscriptionId) -> bool {
        let mut handlers = self.shared.handlers.write();
        let mut found = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(s, _)| *s != subscription);
            found |= list.len() != before;
            !list.is_empty()
        });
        found
    }

    pub(crate) fn subscribe(&self) -> Receiver<MergeEvent> {
        self.shared.feed.subscribe()
    }

    pub(crate) fn poll(&self, cursor: u64, limit: usize) -> Vec<MergeEvent> {
        self.shared.feed.poll(cursor, limit)
    }

    /// Stops accepting batches, drains the queue and joins the thread.
    pub(crate) fn shutdown(&self) {
        drop(self.sender.lock().take());
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if thread::current().id() == self.worker_thread {
            return;
        }
        if worker.join().is_err() {
            error!("merge broadcaster thread panicked");
        }
    }
}

fn run(shared: &Shared, bindings: &Arc<ThreadBindings>, batches: &Receiver<MergeBatch>) {
    let _binding = bindings.bind(Arc::clone(&shared.main), false);
    debug!(main = %shared.main.id(), "merge broadcaster started");
    while let Ok(batch) = batches.recv() {
        shared.apply(batch);
    }
    debug!("merge broadcaster stopped");
}
