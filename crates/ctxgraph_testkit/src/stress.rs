//! Stress runs for serialization lanes.
//!
//! Worker threads increment one counter per lane. With serialized lanes
//! every increment must survive; without serialization, concurrent
//! read-modify-write cycles lose updates and the run reports how many.

use crate::fixtures::increment_visits;
use ctxgraph_core::{Coordinator, PermanentId, TransactionOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for a lane stress run.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Increment transactions per thread.
    pub increments: usize,
    /// Number of lanes; thread `t` uses lane `t % lanes`.
    pub lanes: usize,
    /// Serialize transactions within each lane.
    pub serial: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            increments: 50,
            lanes: 2,
            serial: true,
        }
    }
}

/// Outcome for one lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneOutcome {
    /// Lane name.
    pub lane: String,
    /// Value the counter would reach if no increment were lost.
    pub expected: i64,
    /// Value observed in the main context after all merges.
    pub observed: i64,
}

impl LaneOutcome {
    /// Increments that did not survive.
    pub fn lost_updates(&self) -> i64 {
        self.expected - self.observed
    }
}

/// Result of a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressResult {
    /// Per-lane counters.
    pub lanes: Vec<LaneOutcome>,
    /// Transactions that committed.
    pub successful_ops: usize,
    /// Transactions that returned an error.
    pub failed_ops: usize,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Transactions per second.
    pub ops_per_second: f64,
}

impl StressResult {
    fn new(lanes: Vec<LaneOutcome>, successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Self {
            lanes,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Total increments lost across lanes.
    pub fn lost_updates(&self) -> i64 {
        self.lanes.iter().map(LaneOutcome::lost_updates).sum()
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        for lane in &self.lanes {
            println!(
                "Lane {}: expected {}, observed {}",
                lane.lane, lane.expected, lane.observed
            );
        }
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Lost updates: {}", self.lost_updates());
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} txn/sec", self.ops_per_second);
    }
}

/// Runs the lane increment workload.
///
/// Must be called on the coordinator's UI thread, since it reads the final
/// counters through the main context.
///
/// # Panics
///
/// Panics if a counter cannot be created or read back.
pub fn stress_lane_increments(graph: &Arc<Coordinator>, config: &StressConfig) -> StressResult {
    let lanes = config.lanes.max(1);
    let counters: Vec<PermanentId> = (0..lanes)
        .map(|_| crate::fixtures::seed_page(graph, 0))
        .collect();

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let graph = Arc::clone(graph);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let counter = counters[t % lanes];
            let options = TransactionOptions::new()
                .serial(config.serial)
                .lane(format!("lane-{}", t % lanes));
            let increments = config.increments;

            thread::spawn(move || {
                for _ in 0..increments {
                    match increment_visits(&graph, options.clone(), counter, 1) {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("stress worker panicked");
    }
    graph.wait_for_merges();
    let duration = start.elapsed();

    let outcomes = counters
        .iter()
        .enumerate()
        .map(|(lane, id)| {
            let threads_on_lane = (0..config.threads).filter(|t| t % lanes == lane).count();
            let observed = graph
                .main_context()
                .object(*id)
                .expect("counter readable")
                .and_then(|page| page.get("visits").as_integer())
                .unwrap_or(0);
            LaneOutcome {
                lane: format!("lane-{lane}"),
                expected: (threads_on_lane * config.increments) as i64,
                observed,
            }
        })
        .collect();

    StressResult::new(
        outcomes,
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        duration,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestHarness;

    #[test]
    fn serialized_lanes_lose_nothing() {
        let harness = TestHarness::memory();
        let config = StressConfig {
            threads: 4,
            increments: 10,
            lanes: 2,
            serial: true,
        };

        let result = stress_lane_increments(&harness, &config);

        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 40);
        assert_eq!(result.lost_updates(), 0);
        for lane in &result.lanes {
            assert_eq!(lane.observed, 20);
        }
    }

    #[test]
    fn concurrent_run_never_over_counts() {
        let harness = TestHarness::memory();
        let config = StressConfig {
            threads: 4,
            increments: 10,
            lanes: 1,
            serial: false,
        };

        let result = stress_lane_increments(&harness, &config);

        assert_eq!(result.failed_ops, 0);
        assert!(result.lanes[0].observed <= 40);
        assert!(result.lanes[0].observed >= 10);
    }
}
