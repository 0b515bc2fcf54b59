//! Global feed of merge events.
//!
//! The feed:
//! - Emits only merged commits
//! - Preserves commit order
//! - Supports multiple subscribers
//! - Keeps bounded history for catch-up polling

use super::event::MergeEvent;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};

pub(crate) struct MergeFeed {
    subscribers: RwLock<Vec<Sender<MergeEvent>>>,
    history: RwLock<VecDeque<MergeEvent>>,
    max_history: usize,
}

impl MergeFeed {
    pub(crate) fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    /// Returns a receiver for every event emitted from now on.
    pub(crate) fn subscribe(&self) -> Receiver<MergeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits the events of one merged commit.
    pub(crate) fn emit_batch(&self, events: &[MergeEvent]) {
        if events.is_empty() {
            return;
        }
        {
            let mut history = self.history.write();
            history.extend(events.iter().cloned());
            let excess = history.len().saturating_sub(self.max_history);
            history.drain(..excess);
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }

    /// Returns up to `limit` retained events with a sequence greater than `cursor`.
    pub(crate) fn poll(&self, cursor: u64, limit: usize) -> Vec<MergeEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence.as_u64() > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    #[cfg(test)]
    pub(crate) fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeEventKind;
    use crate::types::SequenceNumber;
    use ctxgraph_store::PermanentId;

    fn event(sequence: u64) -> MergeEvent {
        MergeEvent {
            sequence: SequenceNumber::new(sequence),
            id: PermanentId::generate(),
            entity: "Page".into(),
            kind: MergeEventKind::Inserted,
            changed_fields: vec!["visits".into()],
            fields: None,
        }
    }

    #[test]
    fn emit_and_receive() {
        let feed = MergeFeed::with_max_history(100);
        let rx = feed.subscribe();

        feed.emit_batch(&[event(1), event(1)]);

        assert_eq!(rx.recv().unwrap().sequence.as_u64(), 1);
        assert_eq!(rx.recv().unwrap().sequence.as_u64(), 1);
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = MergeFeed::with_max_history(100);
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit_batch(&[event(1)]);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn poll_from_cursor() {
        let feed = MergeFeed::with_max_history(100);
        for i in 1..=5 {
            feed.emit_batch(&[event(i)]);
        }

        let events = feed.poll(2, 10);
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence.as_u64()).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(feed.poll(0, 2).len(), 2);
    }

    #[test]
    fn history_truncation() {
        let feed = MergeFeed::with_max_history(5);
        for i in 1..=10 {
            feed.emit_batch(&[event(i)]);
        }

        assert_eq!(feed.history_len(), 5);
        assert_eq!(feed.poll(0, 10)[0].sequence.as_u64(), 6);
    }
}
