//! The root of the context tree and the commit path.

use super::node::{ContextNode, NodeKind};
use crate::binding::ThreadBindings;
use crate::config::Config;
use crate::error::CoreResult;
use crate::merge::{MergeBatch, MergeBroadcaster, MergedChange, UnmergedCommits};
use crate::record::{Record, RecordStatus};
use crate::stats::CoordinatorStats;
use crate::types::{NodeId, SequenceNumber};
use ctxgraph_store::{ChangeSet, RowChange, StoreEngine, StoredRow};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Root, main read context and the machinery that links them.
pub(crate) struct ContextTree {
    root: Arc<ContextNode>,
    main: Arc<ContextNode>,
    engine: Arc<dyn StoreEngine>,
    bindings: Arc<ThreadBindings>,
    /// Serializes root commits; held across save and publish.
    commit_lock: Mutex<()>,
    sequence: AtomicU64,
    unmerged: Arc<UnmergedCommits>,
    broadcaster: MergeBroadcaster,
    stats: Arc<CoordinatorStats>,
}

impl ContextTree {
    /// Builds the root and main read context and starts the broadcaster.
    ///
    /// The calling thread becomes the UI thread.
    pub(crate) fn new(
        engine: Arc<dyn StoreEngine>,
        config: &Config,
        stats: Arc<CoordinatorStats>,
    ) -> CoreResult<Self> {
        let main_id = NodeId::next();
        let bindings = Arc::new(ThreadBindings::new(main_id));
        let root = ContextNode::new(
            NodeId::next(),
            NodeKind::Root,
            None,
            Arc::clone(&engine),
            Arc::clone(&bindings),
        );
        let unmerged = Arc::new(UnmergedCommits::default());
        let main = ContextNode::new_main_read(
            main_id,
            Arc::clone(&root),
            Arc::clone(&engine),
            Arc::clone(&bindings),
            Arc::clone(&unmerged),
        );
        let broadcaster = MergeBroadcaster::start(
            Arc::clone(&main),
            Arc::clone(&bindings),
            Arc::clone(&unmerged),
            config,
            Arc::clone(&stats),
        )?;
        debug!(root = %root.id(), main = %main.id(), "context tree created");

        Ok(Self {
            root,
            main,
            engine,
            bindings,
            commit_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            unmerged,
            broadcaster,
            stats,
        })
    }

    pub(crate) fn main(&self) -> &Arc<ContextNode> {
        &self.main
    }

    pub(crate) fn bindings(&self) -> &Arc<ThreadBindings> {
        &self.bindings
    }

    pub(crate) fn broadcaster(&self) -> &MergeBroadcaster {
        &self.broadcaster
    }

    pub(crate) fn engine(&self) -> &Arc<dyn StoreEngine> {
        &self.engine
    }

    /// Returns the sequence of the last commit that reached storage.
    pub(crate) fn committed_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.sequence.load(Ordering::Acquire))
    }

    /// Creates a write context parented at the root.
    pub(crate) fn create_write_node(&self) -> Arc<ContextNode> {
        ContextNode::new(
            NodeId::next(),
            NodeKind::Write,
            Some(Arc::clone(&self.root)),
            Arc::clone(&self.engine),
            Arc::clone(&self.bindings),
        )
    }

    /// Persists `node`'s delta through the root.
    ///
    /// Returns the commit's sequence, or `None` when there was nothing to
    /// commit (no save is issued and no merge is published).
    ///
    /// The batch is registered as unmerged before the save, so the main read
    /// context keeps showing pre-commit versions until the broadcaster has
    /// applied it.
    ///
    /// On failure the node's working set is left as it was, apart from
    /// permanent ids assigned to inserted records, which are kept so a retry
    /// reuses them.
    ///
    /// # Errors
    ///
    /// - [`CoreError::IdentityAllocation`](crate::CoreError) if ids for
    ///   inserted records cannot be obtained
    /// - [`CoreError::Fetch`](crate::CoreError) if the committed version of an
    ///   updated record cannot be read
    /// - [`CoreError::Persistence`](crate::CoreError) if the engine rejects
    ///   the save
    pub(crate) fn commit(&self, node: &ContextNode) -> CoreResult<Option<SequenceNumber>> {
        let delta = node.dirty_records();
        if delta.is_empty() {
            node.mark_clean(&delta);
            self.stats.record_noop_commit();
            debug!(node = %node.id(), "nothing to commit");
            return Ok(None);
        }

        let _commit = self.commit_lock.lock();
        let inserted: Vec<Record> = delta
            .iter()
            .filter(|r| r.state().status == RecordStatus::Inserted)
            .cloned()
            .collect();
        node.obtain_permanent_ids(&inserted)?;

        let (changes, merged) = self.build_changes(&delta)?;
        if changes.is_empty() {
            node.mark_clean(&delta);
            self.stats.record_noop_commit();
            return Ok(None);
        }

        let sequence = SequenceNumber::new(self.sequence.load(Ordering::Acquire) + 1);
        self.unmerged.register(sequence, merged.clone());
        if let Err(err) = self.engine.save(&changes) {
            self.unmerged.withdraw(sequence);
            self.stats.record_failed_commit();
            warn!(node = %node.id(), error = %err, "commit rejected by store");
            return Err(err.into());
        }

        self.sequence.store(sequence.as_u64(), Ordering::Release);
        node.mark_clean(&delta);
        self.stats.record_commit();
        debug!(node = %node.id(), %sequence, changes = changes.len(), "committed");

        self.broadcaster.publish(MergeBatch {
            sequence,
            changes: merged,
        });
        Ok(Some(sequence))
    }

    fn build_changes(&self, delta: &[Record]) -> CoreResult<(ChangeSet, Vec<MergedChange>)> {
        let mut changes = ChangeSet::new();
        let mut merged = Vec::with_capacity(delta.len());
        for record in delta {
            let state = record.state();
            let Some(id) = state.permanent_id else {
                continue;
            };
            let entity = record.entity().to_string();
            match state.status {
                RecordStatus::Clean => {}
                RecordStatus::Inserted => {
                    changes.push(RowChange::Insert {
                        row: StoredRow {
                            id,
                            entity: entity.clone(),
                            fields: state.fields.clone(),
                        },
                    });
                    merged.push(MergedChange {
                        id,
                        entity,
                        before: None,
                        after: Some(state.fields.clone()),
                        changed: state.fields.keys().cloned().collect(),
                    });
                }
                RecordStatus::Updated => {
                    let touched: BTreeMap<_, _> = state
                        .changed
                        .iter()
                        .filter_map(|f| state.fields.get(f).map(|v| (f.clone(), v.clone())))
                        .collect();
                    let before = self.engine.load(id)?.map(|row| row.fields);
                    let mut after = before.clone().unwrap_or_default();
                    after.extend(touched.clone());
                    changes.push(RowChange::Update {
                        id,
                        entity: entity.clone(),
                        fields: touched,
                    });
                    merged.push(MergedChange {
                        id,
                        entity,
                        before,
                        after: Some(after),
                        changed: state.changed.clone(),
                    });
                }
                RecordStatus::Deleted => {
                    let before = self.engine.load(id)?.map(|row| row.fields);
                    changes.push(RowChange::Delete {
                        id,
                        entity: entity.clone(),
                    });
                    merged.push(MergedChange {
                        id,
                        entity,
                        before,
                        after: None,
                        changed: Default::default(),
                    });
                }
            }
        }
        Ok((changes, merged))
    }

    /// Stops the broadcaster after draining pending merges.
    pub(crate) fn shutdown(&self) {
        self.broadcaster.shutdown();
    }
}
