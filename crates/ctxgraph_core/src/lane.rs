//! Serialization lanes.
//!
//! Each lane is a FIFO ticket queue. A serial transaction draws a ticket when
//! it is submitted and may start only once every earlier ticket on the same
//! lane has been released, which happens when that transaction closes.
//! Lanes are independent of one another.

use crate::types::LaneId;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

#[derive(Default)]
struct LaneState {
    next_ticket: u64,
    serving: u64,
    /// Tickets dropped before being served.
    abandoned: BTreeSet<u64>,
}

impl LaneState {
    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
    turn: Condvar,
}

/// Registry of named lanes.
#[derive(Default)]
pub(crate) struct SerializationQueue {
    lanes: Mutex<HashMap<LaneId, Arc<Lane>>>,
}

impl SerializationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes the next place in `lane`.
    pub(crate) fn enqueue(&self, lane: &LaneId) -> Ticket {
        let lane_ref = Arc::clone(self.lanes.lock().entry(lane.clone()).or_default());
        let number = {
            let mut state = lane_ref.state.lock();
            let number = state.next_ticket;
            state.next_ticket += 1;
            number
        };
        trace!(%lane, ticket = number, "enqueued");
        Ticket {
            lane: lane_ref,
            number,
            name: lane.clone(),
            served: false,
        }
    }

    /// Number of lanes ever used.
    #[cfg(test)]
    pub(crate) fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}

/// A place in a lane, not yet started.
///
/// Dropping a ticket without waiting gives up the place without blocking
/// the tickets behind it.
pub(crate) struct Ticket {
    lane: Arc<Lane>,
    number: u64,
    name: LaneId,
    served: bool,
}

impl Ticket {
    /// Blocks until every earlier ticket has been released.
    pub(crate) fn wait(mut self) -> LaneGuard {
        {
            let mut state = self.lane.state.lock();
            while state.serving != self.number {
                self.lane.turn.wait(&mut state);
            }
        }
        self.served = true;
        trace!(lane = %self.name, ticket = self.number, "lane acquired");
        LaneGuard {
            lane: Arc::clone(&self.lane),
            number: self.number,
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.served {
            return;
        }
        let mut state = self.lane.state.lock();
        if state.serving == self.number {
            state.advance();
        } else {
            state.abandoned.insert(self.number);
        }
        self.lane.turn.notify_all();
    }
}

/// Holds a lane until dropped.
pub(crate) struct LaneGuard {
    lane: Arc<Lane>,
    number: u64,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        let mut state = self.lane.state.lock();
        debug_assert_eq!(state.serving, self.number);
        state.advance();
        self.lane.turn.notify_all();
    }
}
