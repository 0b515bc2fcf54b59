//! Commits that reached storage but are not merged into the main context yet.
//!
//! The commit path registers a batch before saving it and the broadcaster
//! withdraws it while holding the main context's merge gate exclusively. A
//! main-context reader holds the gate shared, reads the store first and then
//! rolls back every change still registered. Any commit its store read
//! observed is either registered or already applied, so the reader sees
//! exactly the merged commits.

use super::MergedChange;
use crate::types::SequenceNumber;
use ctxgraph_store::{FetchRequest, PermanentId, StoredRow};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub(crate) struct UnmergedCommits {
    batches: Mutex<BTreeMap<SequenceNumber, Vec<MergedChange>>>,
}

impl UnmergedCommits {
    pub(crate) fn register(&self, sequence: SequenceNumber, changes: Vec<MergedChange>) {
        self.batches.lock().insert(sequence, changes);
    }

    pub(crate) fn withdraw(&self, sequence: SequenceNumber) {
        self.batches.lock().remove(&sequence);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }

    /// Returns the merged version of `id` if an unmerged commit touches it.
    ///
    /// The merged version is the row as it was before the oldest such
    /// commit; `Some(None)` means the row did not exist then.
    pub(crate) fn merged_row(&self, id: PermanentId) -> Option<Option<StoredRow>> {
        let batches = self.batches.lock();
        batches
            .values()
            .flatten()
            .find(|change| change.id == id)
            .map(MergedChange::before_row)
    }

    /// Replaces store rows touched by unmerged commits with their merged
    /// versions, keeping permanent-id order.
    pub(crate) fn roll_back(&self, rows: Vec<StoredRow>, request: &FetchRequest) -> Vec<StoredRow> {
        let mut merged: HashMap<PermanentId, Option<StoredRow>> = HashMap::new();
        {
            let batches = self.batches.lock();
            for change in batches.values().flatten() {
                if change.entity == request.entity {
                    merged.entry(change.id).or_insert_with(|| change.before_row());
                }
            }
        }
        if merged.is_empty() {
            return rows;
        }

        let mut visible: BTreeMap<PermanentId, StoredRow> = rows
            .into_iter()
            .filter(|row| !merged.contains_key(&row.id))
            .map(|row| (row.id, row))
            .collect();
        for row in merged.into_values().flatten() {
            if request.matches_row(&row) {
                visible.insert(row.id, row);
            }
        }
        visible.into_values().collect()
    }
}
