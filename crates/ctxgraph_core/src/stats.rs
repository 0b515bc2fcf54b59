//! Coordinator statistics.
//!
//! All counters are atomic and monotonically increasing; they can be read
//! while transactions and merges are in flight.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a coordinator.
#[derive(Debug, Default)]
pub(crate) struct CoordinatorStats {
    transactions_started: AtomicU64,
    transactions_cancelled: AtomicU64,
    commits: AtomicU64,
    noop_commits: AtomicU64,
    failed_commits: AtomicU64,
    merges: AtomicU64,
    events_dispatched: AtomicU64,
}

impl CoordinatorStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_cancel(&self) {
        self.transactions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a commit that reached storage.
    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a commit with an empty delta.
    pub(crate) fn record_noop_commit(&self) {
        self.noop_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_commit(&self) {
        self.failed_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one merged batch and the events it dispatched.
    pub(crate) fn record_merge(&self, events: u64) {
        self.merges.fetch_add(1, Ordering::Relaxed);
        self.events_dispatched.fetch_add(events, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started.load(Ordering::Relaxed),
            transactions_cancelled: self.transactions_cancelled.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            noop_commits: self.noop_commits.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the coordinator's counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Transactions that reached the `Bound` state.
    pub transactions_started: u64,
    /// Transactions that ended without their implicit commit.
    pub transactions_cancelled: u64,
    /// Commits persisted by the storage engine.
    pub commits: u64,
    /// Commits skipped because nothing had changed.
    pub noop_commits: u64,
    /// Commits the storage engine rejected.
    pub failed_commits: u64,
    /// Batches merged into the main context.
    pub merges: u64,
    /// Merge events delivered to observers.
    pub events_dispatched: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(CoordinatorStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_commits_and_merges() {
        let stats = CoordinatorStats::new();
        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_commit();
        stats.record_noop_commit();
        stats.record_transaction_cancel();
        stats.record_merge(3);
        stats.record_merge(2);

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 2);
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.noop_commits, 1);
        assert_eq!(snap.transactions_cancelled, 1);
        assert_eq!(snap.merges, 2);
        assert_eq!(snap.events_dispatched, 5);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(CoordinatorStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_commit();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().commits, 800);
    }
}
