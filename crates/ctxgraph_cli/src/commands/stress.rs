//! Stress command implementation.

use ctxgraph_core::{Config, Coordinator};
use ctxgraph_store::StoreLocation;
use ctxgraph_testkit::{page_schema, stress_lane_increments, StressConfig};
use std::sync::Arc;
use tracing::info;

/// Runs the stress command against an in-memory store.
///
/// The calling thread opens the coordinator and so acts as its UI thread.
pub fn run(config: &StressConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if config.threads == 0 || config.lanes == 0 {
        return Err("threads and lanes must be at least 1".into());
    }

    let graph = Arc::new(Coordinator::open(
        page_schema(),
        StoreLocation::InMemory,
        Config::new().thread_name_prefix("ctxgraph-stress"),
    )?);
    info!(
        threads = config.threads,
        increments = config.increments,
        lanes = config.lanes,
        serial = config.serial,
        "starting stress run"
    );
    let result = stress_lane_increments(&graph, config);
    graph.close();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            let name = if config.serial {
                "serial lane increments"
            } else {
                "concurrent increments"
            };
            result.print_summary(name);
        }
    }

    if config.serial && result.lost_updates() > 0 {
        return Err("serialized lanes lost updates".into());
    }
    Ok(())
}
