//! Coordinator configuration.

use crate::types::LaneId;

/// Configuration for a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether transactions without an explicit `serial` flag join their lane.
    pub serial_by_default: bool,

    /// Lane used when a transaction names none.
    pub default_lane: LaneId,

    /// Number of merge events kept for [`poll`](crate::Coordinator::poll).
    pub merge_history: usize,

    /// Prefix for the names of threads the coordinator spawns.
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_by_default: true,
            default_lane: LaneId::default(),
            merge_history: 10_000,
            thread_name_prefix: "ctxgraph".to_string(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether transactions are serialized unless they opt out.
    #[must_use]
    pub const fn serial_by_default(mut self, value: bool) -> Self {
        self.serial_by_default = value;
        self
    }

    /// Sets the lane used by transactions that name none.
    #[must_use]
    pub fn default_lane(mut self, lane: impl Into<LaneId>) -> Self {
        self.default_lane = lane.into();
        self
    }

    /// Sets how many merge events are retained for polling.
    #[must_use]
    pub const fn merge_history(mut self, events: usize) -> Self {
        self.merge_history = events;
        self
    }

    /// Sets the thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}
