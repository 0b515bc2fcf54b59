//! The coordinator: entry point tying the context tree, lanes and merges together.

use crate::config::Config;
use crate::context::{ContextNode, ContextTree, NodeKind};
use crate::error::{fatal, CoreError, CoreResult, UsageFault};
use crate::merge::{MergeEvent, SubscriptionId, UpdateHandler};
use crate::record::Record;
use crate::stats::{CoordinatorStats, StatsSnapshot};
use crate::transaction::{PendingTransaction, Transaction, TransactionOptions, TransactionRunner};
use crate::types::SequenceNumber;
use ctxgraph_store::{open_store, Schema, StoreEngine, StoreLocation};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use tracing::info;

/// Process-scoped owner of the context tree.
///
/// The thread that constructs a coordinator becomes its UI thread: it is
/// permanently bound to the main read context, may read main-context records
/// freely, and may never write or run a synchronous transaction.
///
/// Share a coordinator between threads with `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// use ctxgraph_core::{Config, Coordinator, FetchRequest, TransactionOptions};
/// use ctxgraph_store::{EntityDef, FieldKind, Schema, StoreLocation};
///
/// let schema = Schema::new().with_entity(EntityDef::new("Page").field("visits", FieldKind::Integer));
/// let graph = Coordinator::open(schema, StoreLocation::InMemory, Config::default())?;
///
/// let pending = graph.spawn_transaction(TransactionOptions::new(), |txn| {
///     txn.context().insert("Page").set("visits", 5);
///     Ok(())
/// })?;
/// pending.wait()?;
/// graph.wait_for_merges();
///
/// let pages = graph.main_context().fetch(&FetchRequest::new("Page"))?;
/// assert_eq!(pages[0].get("visits").as_integer(), Some(5));
/// # Ok::<(), ctxgraph_core::CoreError>(())
/// ```
pub struct Coordinator {
    tree: Arc<ContextTree>,
    runner: Arc<TransactionRunner>,
    stats: Arc<CoordinatorStats>,
    config: Config,
    open: AtomicBool,
}

impl Coordinator {
    /// Opens a store and builds a coordinator over it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Store`] if the store cannot be opened, or
    /// [`CoreError::ThreadSpawn`] if the broadcaster cannot start.
    pub fn open(schema: Schema, location: StoreLocation, config: Config) -> CoreResult<Self> {
        let engine = open_store(schema, location)?;
        Self::with_engine(engine, config)
    }

    /// Builds a coordinator over an already open engine.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ThreadSpawn`] if the broadcaster cannot start.
    pub fn with_engine(engine: Arc<dyn StoreEngine>, config: Config) -> CoreResult<Self> {
        let stats = Arc::new(CoordinatorStats::new());
        let tree = Arc::new(ContextTree::new(engine, &config, Arc::clone(&stats))?);
        let runner = Arc::new(TransactionRunner::new(
            Arc::clone(&tree),
            config.clone(),
            Arc::clone(&stats),
        ));
        info!(
            ui_thread = ?thread::current().id(),
            serial_by_default = config.serial_by_default,
            "coordinator opened"
        );
        Ok(Self {
            tree,
            runner,
            stats,
            config,
            open: AtomicBool::new(true),
        })
    }

    /// Runs a write transaction on the calling thread and waits for it.
    ///
    /// The body receives the transaction handle; its write context is
    /// committed when the body returns `Ok`, unless the body cancelled the
    /// implicit commit. A body returning `Err` commits nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`close`](Self::close), the body's
    /// own error, or the commit's error.
    ///
    /// # Panics
    ///
    /// Panics when called on the UI thread.
    #[track_caller]
    pub fn run_transaction<T, F>(&self, options: TransactionOptions, body: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        self.ensure_open()?;
        self.runner.run(&options, body)
    }

    /// Runs a write transaction on a new thread.
    ///
    /// Legal from any thread, including the UI thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] after [`close`](Self::close) or
    /// [`CoreError::ThreadSpawn`] if the thread cannot start.
    pub fn spawn_transaction<T, F>(
        &self,
        options: TransactionOptions,
        body: F,
    ) -> CoreResult<PendingTransaction<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction) -> CoreResult<T> + Send + 'static,
    {
        self.ensure_open()?;
        self.runner.spawn(&options, body)
    }

    /// Returns the context bound to the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread has no context bound.
    #[track_caller]
    #[must_use]
    pub fn current_context(&self) -> Arc<ContextNode> {
        let bindings = self.tree.bindings();
        if let Some(node) = bindings.bound_node() {
            return node;
        }
        if bindings.is_main_thread() {
            return Arc::clone(self.tree.main());
        }
        fatal(UsageFault::NoContextBound {
            thread: format!("{:?}", thread::current().id()),
        })
    }

    /// Returns the shared main read context.
    #[must_use]
    pub fn main_context(&self) -> &Arc<ContextNode> {
        self.tree.main()
    }

    /// Returns the current context's instance of `record`.
    ///
    /// Returns `None` if the record has no permanent id, its source context
    /// has uncommitted changes, or it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Fetch`] if the record must be loaded and the
    /// engine cannot answer.
    #[track_caller]
    pub fn transfer_into_current_context(&self, record: &Record) -> CoreResult<Option<Record>> {
        let Some(id) = record.permanent_id() else {
            return Ok(None);
        };
        if record.try_owner().is_some_and(|source| source.is_dirty()) {
            return Ok(None);
        }
        let current = self.current_context();
        if record.owner_id() == current.id() {
            return Ok(Some(record.clone()));
        }
        current.object(id)
    }

    /// Calls `handler` after every merge that affects `record`.
    ///
    /// Handlers run on the broadcaster thread, after the merge is visible
    /// through the main context. They are dropped when the record is deleted.
    ///
    /// # Panics
    ///
    /// Panics if `record` is not owned by the main read context.
    #[track_caller]
    pub fn attach_update_handler<F>(&self, record: &Record, handler: F) -> SubscriptionId
    where
        F: Fn(&MergeEvent) + Send + Sync + 'static,
    {
        let main = self.tree.main();
        let id = match record.permanent_id() {
            Some(id) if record.owner_id() == main.id() => id,
            _ => fatal(UsageFault::NotMainContext {
                node: record.owner_id(),
            }),
        };
        let handler: UpdateHandler = Arc::new(handler);
        self.tree.broadcaster().attach(id, handler)
    }

    /// Detaches a handler; returns false if it was not attached.
    pub fn detach_update_handler(&self, subscription: SubscriptionId) -> bool {
        self.tree.broadcaster().detach(subscription)
    }

    /// Cancels the implicit commit of the calling thread's transaction.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not running a transaction body.
    #[track_caller]
    pub fn cancel_implicit_commit(&self) {
        let node = self.transaction_node();
        self.tree.bindings().suppress_implicit_commit(node.id());
    }

    /// Commits the calling thread's transaction so far and keeps it running.
    ///
    /// # Errors
    ///
    /// Returns the storage engine's error; the write context keeps its
    /// changes.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not running a transaction body.
    #[track_caller]
    pub fn force_commit(&self) -> CoreResult<Option<SequenceNumber>> {
        let node = self.transaction_node();
        self.tree.commit(&node)
    }

    #[track_caller]
    fn transaction_node(&self) -> Arc<ContextNode> {
        let node = self.current_context();
        if node.kind() != NodeKind::Write || !self.tree.bindings().inside_transaction() {
            fatal(UsageFault::NotInTransaction { node: node.id() });
        }
        node
    }

    /// Subscribes to every merge event from now on.
    pub fn subscribe(&self) -> Receiver<MergeEvent> {
        self.tree.broadcaster().subscribe()
    }

    /// Returns up to `limit` retained merge events of commits after `cursor`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<MergeEvent> {
        self.tree.broadcaster().poll(cursor, limit)
    }

    /// Blocks until every commit so far is merged and its events dispatched.
    pub fn wait_for_merges(&self) {
        self.tree.broadcaster().wait_for_merges();
    }

    /// Returns the sequence of the last commit that reached storage.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        self.tree.committed_sequence()
    }

    /// Returns the sequence of the last commit merged into the main context.
    #[must_use]
    pub fn merged_seq(&self) -> SequenceNumber {
        self.tree.broadcaster().merged_sequence()
    }

    /// Returns a snapshot of the coordinator's counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the storage engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn StoreEngine> {
        self.tree.engine()
    }

    /// Returns false once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Stops accepting transactions and drains pending merges.
    ///
    /// Transactions already running finish; their commits reach storage.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.tree.shutdown();
            info!(committed = %self.committed_seq(), "coordinator closed");
        }
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::Closed)
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchRequest, LaneId, MergeEventKind, RecordStatus, TransactionState};
    use ctxgraph_store::{
        ChangeSet, EntityDef, FieldKind, MemoryStore, PermanentId, RowChange, StoredRow, Value,
    };
    use std::any::Any;
    use std::collections::HashMap;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc;
    use std::time::Duration;

    fn schema() -> Schema {
        Schema::new().with_entity(
            EntityDef::new("Page")
                .field("visits", FieldKind::Integer)
                .field("title", FieldKind::Text)
                .field("parent", FieldKind::Reference),
        )
    }

    fn coordinator() -> (Arc<Coordinator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(schema()));
        let graph = Coordinator::with_engine(store.clone(), Config::default()).unwrap();
        (Arc::new(graph), store)
    }

    fn on_worker<T, F>(graph: &Arc<Coordinator>, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&Coordinator) -> T + Send + 'static,
    {
        let graph = Arc::clone(graph);
        thread::spawn(move || f(&graph)).join().unwrap()
    }

    fn fault_on_worker<F>(graph: &Arc<Coordinator>, f: F) -> String
    where
        F: FnOnce(&Coordinator) + Send + 'static,
    {
        let graph = Arc::clone(graph);
        let payload = thread::spawn(move || f(&graph)).join().unwrap_err();
        panic_message(payload)
    }

    fn panic_message(payload: Box<dyn Any + Send>) -> String {
        payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_string()))
            .unwrap_or_default()
    }

    fn insert_page(graph: &Arc<Coordinator>, visits: i64) -> PermanentId {
        on_worker(graph, move |g| {
            let page = g
                .run_transaction(TransactionOptions::new(), |txn| {
                    let page = txn.context().insert("Page");
                    page.set("visits", visits);
                    Ok(page)
                })
                .unwrap();
            page.permanent_id().unwrap()
        })
    }

    fn set_visits(graph: &Arc<Coordinator>, id: PermanentId, visits: i64) {
        on_worker(graph, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let page = txn.context().object(id)?.unwrap();
                page.set("visits", visits);
                Ok(())
            })
            .unwrap();
        });
    }

    #[test]
    fn round_trip_reaches_main_context() {
        let (graph, store) = coordinator();
        let id = insert_page(&graph, 5);
        graph.wait_for_merges();

        let page = graph.main_context().object(id).unwrap().unwrap();
        assert_eq!(page.get("visits"), Value::Integer(5));
        assert_eq!(page.status(), RecordStatus::Clean);
        assert_eq!(store.save_count(), 1);

        let stats = graph.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.merges, 1);
        assert_eq!(graph.committed_seq(), graph.merged_seq());
    }

    #[test]
    fn empty_transaction_is_a_noop() {
        let (graph, store) = coordinator();
        on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new(), |_| Ok(())).unwrap();
        });
        graph.wait_for_merges();

        assert_eq!(store.save_count(), 0);
        assert!(graph.poll(0, 10).is_empty());
        let stats = graph.stats();
        assert_eq!(stats.noop_commits, 1);
        assert_eq!(stats.merges, 0);
    }

    #[test]
    fn body_error_skips_commit() {
        let (graph, store) = coordinator();
        let result = on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                txn.context().insert("Page").set("visits", 1);
                Err::<(), _>(CoreError::aborted(txn.id(), "changed my mind"))
            })
        });

        assert!(matches!(result, Err(CoreError::TransactionAborted { .. })));
        assert_eq!(store.save_count(), 0);
        assert_eq!(graph.stats().transactions_cancelled, 1);
    }

    #[test]
    fn cancelled_implicit_commit_discards_changes() {
        let (graph, store) = coordinator();
        on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                txn.context().insert("Page").set("visits", 1);
                txn.cancel_implicit_commit();
                Ok(())
            })
            .unwrap();
        });
        assert_eq!(store.save_count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn failed_commit_keeps_local_changes() {
        let (graph, store) = coordinator();
        let id = insert_page(&graph, 5);
        store.fail_next_save();

        on_worker(&graph, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let page = txn.context().object(id)?.unwrap();
                page.set("visits", 6);

                let err = txn.commit().unwrap_err();
                assert!(matches!(err, CoreError::Persistence(_)));
                assert!(txn.context().has_changes());
                assert_eq!(page.get("visits"), Value::Integer(6));
                assert_eq!(page.status(), RecordStatus::Updated);

                assert!(txn.commit()?.is_some());
                Ok(())
            })
            .unwrap();
        });
        graph.wait_for_merges();

        let page = graph.main_context().object(id).unwrap().unwrap();
        assert_eq!(page.get("visits"), Value::Integer(6));
        assert_eq!(graph.stats().failed_commits, 1);
    }

    #[test]
    fn failed_implicit_commit_is_returned() {
        let (graph, store) = coordinator();
        let id = insert_page(&graph, 5);
        graph.wait_for_merges();
        store.fail_next_save();

        let result = on_worker(&graph, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                txn.context().object(id)?.unwrap().set("visits", 9);
                Ok(())
            })
        });
        graph.wait_for_merges();

        assert!(matches!(result, Err(CoreError::Persistence(_))));
        let page = graph.main_context().object(id).unwrap().unwrap();
        assert_eq!(page.get("visits"), Value::Integer(5));
    }

    #[test]
    fn identity_allocation_failure_is_returned() {
        let (graph, store) = coordinator();
        store.fail_next_allocation();
        let result = on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                txn.context().insert("Page");
                Ok(())
            })
        });
        assert!(matches!(result, Err(CoreError::IdentityAllocation(_))));
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn fetch_reflects_pending_changes() {
        let (graph, _store) = coordinator();
        let first = insert_page(&graph, 1);
        let second = insert_page(&graph, 2);

        on_worker(&graph, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let ctx = txn.context();
                ctx.insert("Page").set("visits", 3);
                let doomed = ctx.object(first)?.unwrap();
                ctx.delete(&doomed);
                ctx.object(second)?.unwrap().set("visits", 10);

                let mut visits: Vec<i64> = ctx
                    .fetch(&FetchRequest::new("Page"))?
                    .iter()
                    .filter_map(|r| r.get("visits").as_integer())
                    .collect();
                visits.sort_unstable();
                assert_eq!(visits, vec![3, 10]);

                assert_eq!(ctx.fetch(&FetchRequest::new("Page").equals("visits", 10))?.len(), 1);
                assert_eq!(ctx.fetch(&FetchRequest::new("Page").equals("visits", 2))?.len(), 0);
                assert_eq!(ctx.count(&FetchRequest::new("Page"))?, 2);
                assert_eq!(ctx.fetch(&FetchRequest::new("Page").limit(1))?.len(), 1);

                txn.cancel_implicit_commit();
                Ok(())
            })
            .unwrap();
        });
    }

    #[test]
    fn deleting_an_uncommitted_insert_discards_it() {
        let (graph, store) = coordinator();
        on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let page = txn.context().insert("Page");
                txn.context().delete(&page);
                assert!(!txn.context().has_changes());
                Ok(())
            })
            .unwrap();
        });
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn write_from_ui_thread_faults_before_storage() {
        let (graph, store) = coordinator();
        let id = insert_page(&graph, 5);
        graph.wait_for_merges();
        let page = graph.main_context().object(id).unwrap().unwrap();

        let payload = panic::catch_unwind(AssertUnwindSafe(|| page.set("visits", 6))).unwrap_err();
        assert!(panic_message(payload).starts_with("main thread write"));
        assert_eq!(store.save_count(), 1);
        assert_eq!(page.get("visits"), Value::Integer(5));
    }

    #[test]
    fn sync_transaction_on_ui_thread_faults() {
        let (graph, _store) = coordinator();
        let payload = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = graph.run_transaction(TransactionOptions::new(), |_| Ok(()));
        }))
        .unwrap_err();
        assert!(panic_message(payload).starts_with("main thread transaction"));
    }

    #[test]
    fn unbound_worker_faults() {
        let (graph, _store) = coordinator();
        let id = insert_page(&graph, 5);
        graph.wait_for_merges();
        let page = graph.main_context().object(id).unwrap().unwrap();

        let message = fault_on_worker(&graph, move |_| {
            let _ = page.get("visits");
        });
        assert!(message.starts_with("no context bound"));
    }

    #[test]
    fn record_from_outer_transaction_is_wrong_context() {
        let (graph, _store) = coordinator();
        let message = fault_on_worker(&graph, |g| {
            let _ = g.run_transaction(TransactionOptions::new(), |txn| {
                let outer = txn.context().insert("Page");
                g.run_transaction(TransactionOptions::new(), |_| {
                    let _ = outer.get("visits");
                    Ok(())
                })
            });
        });
        assert!(message.starts_with("wrong context"));
    }

    #[test]
    fn linking_records_across_contexts_faults() {
        let (graph, _store) = coordinator();
        let message = fault_on_worker(&graph, |g| {
            let _ = g.run_transaction(TransactionOptions::new(), |txn| {
                let outer = txn.context().insert("Page");
                g.run_transaction(TransactionOptions::new(), |inner| {
                    let page = inner.context().insert("Page");
                    page.set_reference("parent", Some(&outer))
                })
            });
        });
        assert!(message.starts_with("cross-context relationship"));
    }

    #[test]
    fn record_outliving_its_transaction_faults() {
        let (graph, _store) = coordinator();
        let message = fault_on_worker(&graph, |g| {
            let page = g
                .run_transaction(TransactionOptions::new(), |txn| Ok(txn.context().insert("Page")))
                .unwrap();
            let _ = page.get("visits");
        });
        assert!(message.starts_with("destroyed context"));
    }

    #[test]
    fn unknown_field_faults() {
        let (graph, _store) = coordinator();
        let message = fault_on_worker(&graph, |g| {
            let _ = g.run_transaction(TransactionOptions::new(), |txn| {
                txn.context().insert("Page").set("visits", "many");
                Ok(())
            });
        });
        assert!(message.starts_with("schema violation"));
    }

    #[test]
    fn nested_transaction_bypasses_the_lane() {
        let (graph, _store) = coordinator();
        let found = on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new().serial(true), |outer| {
                assert_eq!(outer.lane().map(LaneId::as_str), Some("default"));
                g.run_transaction(TransactionOptions::new().serial(true), |inner| {
                    assert!(inner.lane().is_none());
                    inner.context().insert("Page").set("visits", 1);
                    Ok(())
                })?;
                outer.context().count(&FetchRequest::new("Page"))
            })
            .unwrap()
        });
        assert_eq!(found, 1);
    }

    #[test]
    fn references_resolve_within_the_context() {
        let (graph, _store) = coordinator();
        let (parent_id, child_id) = on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let parent = txn.context().insert("Page");
                let child = txn.context().insert("Page");
                child.set_reference("parent", Some(&parent))?;
                assert!(parent.permanent_id().is_some());
                assert!(child.reference("parent")?.unwrap().same_instance(&parent));
                Ok((parent.permanent_id().unwrap(), child))
            })
            .map(|(parent, child)| (parent, child.permanent_id().unwrap()))
            .unwrap()
        });
        graph.wait_for_merges();

        let child = graph.main_context().object(child_id).unwrap().unwrap();
        assert_eq!(child.get("parent"), Value::Reference(parent_id));
        let parent = child.reference("parent").unwrap().unwrap();
        assert_eq!(parent.permanent_id(), Some(parent_id));
    }

    #[test]
    fn transfer_requires_permanent_id_and_clean_source() {
        let (graph, _store) = coordinator();
        let id = insert_page(&graph, 5);
        graph.wait_for_merges();
        let main_page = graph.main_context().object(id).unwrap().unwrap();

        on_worker(&graph, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let fresh = txn.context().insert("Page");
                assert!(g.transfer_into_current_context(&fresh)?.is_none());

                let copy = g.transfer_into_current_context(&main_page)?.unwrap();
                assert!(!copy.same_instance(&main_page));
                assert_eq!(copy.owner_id(), txn.context().id());
                assert_eq!(copy.get("visits"), Value::Integer(5));

                let same = g.transfer_into_current_context(&copy)?.unwrap();
                assert!(same.same_instance(&copy));

                copy.set("visits", 6);
                g.run_transaction(TransactionOptions::new(), |_| {
                    assert!(g.transfer_into_current_context(&copy)?.is_none());
                    Ok(())
                })?;
                txn.cancel_implicit_commit();
                Ok(())
            })
            .unwrap();
        });
    }

    #[test]
    fn update_handlers_fire_after_merge() {
        let (graph, _store) = coordinator();
        let id = insert_page(&graph, 5);
        graph.wait_for_merges();
        let page = graph.main_context().object(id).unwrap().unwrap();

        let (tx, rx) = mpsc::channel();
        let observer = Arc::clone(&graph);
        let subscription = graph.attach_update_handler(&page, move |event| {
            let visits = observer.main_context().object(event.id).unwrap().unwrap().get("visits");
            tx.send((event.kind, visits)).unwrap();
        });

        set_visits(&graph, id, 6);
        let (kind, visits) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(kind, MergeEventKind::Updated);
        assert_eq!(visits, Value::Integer(6));

        assert!(graph.detach_update_handler(subscription));
        assert!(!graph.detach_update_handler(subscription));
        set_visits(&graph, id, 7);
        graph.wait_for_merges();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn main_context_never_shows_a_half_merged_commit() {
        let (graph, _store) = coordinator();
        let x = insert_page(&graph, 1);
        let y = insert_page(&graph, 1);
        let z = insert_page(&graph, 1);
        graph.wait_for_merges();
        let main = graph.main_context();
        main.object(x).unwrap().unwrap();
        let z_page = main.object(z).unwrap().unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = parking_lot::Mutex::new(release_rx);
        graph.attach_update_handler(&z_page, move |_| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().recv();
        });

        set_visits(&graph, z, 30);
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        on_worker(&graph, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let ctx = txn.context();
                ctx.object(x)?.unwrap().set("visits", 2);
                ctx.object(y)?.unwrap().set("visits", 2);
                Ok(())
            })
            .unwrap();
        });
        assert!(graph.committed_seq() > graph.merged_seq());

        let visits: HashMap<PermanentId, Value> = main
            .fetch(&FetchRequest::new("Page"))
            .unwrap()
            .iter()
            .map(|page| (page.permanent_id().unwrap(), page.get("visits")))
            .collect();
        assert_eq!(visits[&x], Value::Integer(1));
        assert_eq!(visits[&y], Value::Integer(1));
        assert_eq!(visits[&z], Value::Integer(30));
        assert_eq!(main.count(&FetchRequest::new("Page")).unwrap(), 3);
        assert_eq!(main.object(y).unwrap().unwrap().get("visits"), Value::Integer(1));

        release_tx.send(()).unwrap();
        graph.wait_for_merges();
        assert_eq!(graph.committed_seq(), graph.merged_seq());
        assert_eq!(main.object(x).unwrap().unwrap().get("visits"), Value::Integer(2));
        assert_eq!(main.object(y).unwrap().unwrap().get("visits"), Value::Integer(2));
    }

    #[test]
    fn editing_a_discarded_insert_commits_nothing() {
        let (graph, store) = coordinator();
        on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let ctx = txn.context();
                let page = ctx.insert("Page");
                ctx.delete(&page);
                page.set("visits", 4);
                assert!(!ctx.has_changes());
                Ok(())
            })
            .unwrap();
        });
        assert_eq!(store.save_count(), 0);
        assert_eq!(graph.stats().noop_commits, 1);
        assert_eq!(graph.committed_seq(), SequenceNumber::new(0));
    }

    #[test]
    fn handler_on_write_context_record_faults() {
        let (graph, _store) = coordinator();
        let message = fault_on_worker(&graph, |g| {
            let _ = g.run_transaction(TransactionOptions::new(), |txn| {
                let page = txn.context().insert("Page");
                g.attach_update_handler(&page, |_| {});
                Ok(())
            });
        });
        assert!(message.starts_with("not main context"));
    }

    #[test]
    fn unseen_record_is_refreshed() {
        let store = Arc::new(MemoryStore::new(schema()));
        let id = PermanentId::generate();
        let mut row = StoredRow::new(id, "Page");
        row.fields.insert("visits".into(), Value::Integer(1));
        store
            .save(&ChangeSet::from(vec![RowChange::Insert { row }]))
            .unwrap();
        let graph = Arc::new(Coordinator::with_engine(store, Config::default()).unwrap());
        let events = graph.subscribe();

        set_visits(&graph, id, 2);
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.kind, MergeEventKind::Refreshed);
        assert!(event.touched("visits"));
        assert_eq!(
            graph.main_context().object(id).unwrap().unwrap().get("visits"),
            Value::Integer(2)
        );
    }

    #[test]
    fn delete_is_merged() {
        let (graph, _store) = coordinator();
        let id = insert_page(&graph, 5);
        graph.wait_for_merges();
        let page = graph.main_context().object(id).unwrap().unwrap();

        on_worker(&graph, move |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                let page = txn.context().object(id)?.unwrap();
                txn.context().delete(&page);
                Ok(())
            })
            .unwrap();
        });
        graph.wait_for_merges();

        assert!(page.is_deleted());
        assert!(graph.main_context().object(id).unwrap().is_none());
        let kinds: Vec<_> = graph.poll(0, 10).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![MergeEventKind::Inserted, MergeEventKind::Deleted]);
    }

    #[test]
    fn poll_resumes_from_cursor() {
        let (graph, _store) = coordinator();
        insert_page(&graph, 1);
        insert_page(&graph, 2);
        graph.wait_for_merges();

        assert_eq!(graph.poll(0, 10).len(), 2);
        let rest = graph.poll(1, 10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].sequence, SequenceNumber::new(2));
    }

    #[test]
    fn ambient_operations_use_the_thread_binding() {
        let (graph, store) = coordinator();
        on_worker(&graph, |g| {
            g.run_transaction(TransactionOptions::new(), |txn| {
                assert_eq!(g.current_context().id(), txn.context().id());
                assert_eq!(txn.state(), TransactionState::Running);
                txn.context().insert("Page").set("visits", 1);
                assert!(g.force_commit()?.is_some());
                txn.context().insert("Page").set("visits", 2);
                g.cancel_implicit_commit();
                Ok(())
            })
            .unwrap();
        });
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(graph.current_context().id(), graph.main_context().id());
    }

    #[test]
    fn spawned_transactions_start_in_submission_order() {
        let (graph, _store) = coordinator();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pending: Vec<_> = (0..4)
            .map(|i| {
                let order = Arc::clone(&order);
                graph
                    .spawn_transaction(TransactionOptions::new().lane("ordered"), move |_| {
                        order.lock().push(i);
                        thread::sleep(Duration::from_millis(5));
                        Ok(i)
                    })
                    .unwrap()
            })
            .collect();
        let results: Vec<i32> = pending.into_iter().map(|p| p.wait().unwrap()).collect();

        assert_eq!(results, vec![0, 1, 2, 3]);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn closed_coordinator_rejects_transactions() {
        let (graph, _store) = coordinator();
        graph.close();
        assert!(!graph.is_open());
        let result = on_worker(&graph, |g| g.run_transaction(TransactionOptions::new(), |_| Ok(())));
        assert!(matches!(result, Err(CoreError::Closed)));
        assert!(matches!(
            graph.spawn_transaction(TransactionOptions::new(), |_| Ok(())),
            Err(CoreError::Closed)
        ));
    }

    #[test]
    fn file_store_commits_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::Directory(dir.path().to_path_buf());

        let graph = Arc::new(Coordinator::open(schema(), location.clone(), Config::default()).unwrap());
        let id = insert_page(&graph, 41);
        set_visits(&graph, id, 42);
        graph.close();
        drop(graph);

        let graph = Coordinator::open(schema(), location, Config::default()).unwrap();
        let page = graph.main_context().object(id).unwrap().unwrap();
        assert_eq!(page.get("visits"), Value::Integer(42));
    }
}
