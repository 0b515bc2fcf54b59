//! Inspect command implementation.

use ctxgraph_store::{FileStore, LogScan, PermanentId, RowChange, StoreResult};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Commit log summary.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store directory.
    pub path: String,
    /// Log file size in bytes.
    pub log_size: u64,
    /// Bytes covered by complete commits.
    pub valid_size: u64,
    /// True if the log ends with an incomplete commit.
    pub torn_tail: bool,
    /// Number of persisted commits.
    pub commit_count: usize,
    /// Sequence of the last persisted commit.
    pub last_sequence: u64,
    /// Insert changes across all commits.
    pub inserts: usize,
    /// Update changes across all commits.
    pub updates: usize,
    /// Delete changes across all commits.
    pub deletes: usize,
    /// Live rows per entity after replaying the log.
    pub live_rows: BTreeMap<String, usize>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Scans the commit log under `path` and summarizes it.
pub fn inspect(path: &Path) -> StoreResult<InspectResult> {
    let scan = FileStore::scan_log(path)?;
    Ok(summarize(path, &scan))
}

fn summarize(path: &Path, scan: &LogScan) -> InspectResult {
    let mut result = InspectResult {
        path: path.display().to_string(),
        log_size: scan.total_len,
        valid_size: scan.valid_len,
        torn_tail: scan.has_torn_tail(),
        commit_count: scan.frames.len(),
        last_sequence: scan.frames.last().map_or(0, |frame| frame.sequence),
        inserts: 0,
        updates: 0,
        deletes: 0,
        live_rows: BTreeMap::new(),
    };

    let mut live: HashMap<PermanentId, String> = HashMap::new();
    for change in scan.frames.iter().flat_map(|frame| &frame.changes.changes) {
        match change {
            RowChange::Insert { row } => {
                result.inserts += 1;
                live.insert(row.id, row.entity.clone());
            }
            RowChange::Update { .. } => result.updates += 1,
            RowChange::Delete { id, .. } => {
                result.deletes += 1;
                live.remove(id);
            }
        }
    }
    for entity in live.into_values() {
        *result.live_rows.entry(entity).or_insert(0) += 1;
    }

    result
}

fn print_text_output(result: &InspectResult) {
    println!("ctxgraph Store Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Commit log:");
    println!("  Size:          {}", format_size(result.log_size));
    println!("  Commits:       {}", result.commit_count);
    println!("  Last sequence: {}", result.last_sequence);
    if result.torn_tail {
        println!(
            "  Torn tail:     {} bytes after the last complete commit",
            result.log_size - result.valid_size
        );
    }
    println!();
    println!("Changes:");
    println!("  Inserts: {}", result.inserts);
    println!("  Updates: {}", result.updates);
    println!("  Deletes: {}", result.deletes);

    if !result.live_rows.is_empty() {
        println!();
        println!("Live rows:");
        for (entity, count) in &result.live_rows {
            println!("  {entity}: {count}");
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxgraph_store::{ChangeSet, StoreEngine, StoredRow, Value};
    use ctxgraph_testkit::page_schema;
    use tempfile::tempdir;

    #[test]
    fn replays_inserts_and_deletes() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(page_schema(), dir.path()).unwrap();
            let ids = store.allocate_permanent_ids("Page", 2).unwrap();
            let rows = ids
                .iter()
                .map(|id| RowChange::Insert {
                    row: StoredRow::new(*id, "Page"),
                })
                .collect::<Vec<_>>();
            store.save(&ChangeSet::from(rows)).unwrap();
            store
                .save(&ChangeSet::from(vec![
                    RowChange::Update {
                        id: ids[0],
                        entity: "Page".into(),
                        fields: BTreeMap::from([("visits".to_string(), Value::Integer(3))]),
                    },
                    RowChange::Delete {
                        id: ids[1],
                        entity: "Page".into(),
                    },
                ]))
                .unwrap();
        }

        let result = inspect(dir.path()).unwrap();
        assert_eq!(result.commit_count, 2);
        assert_eq!(result.last_sequence, 2);
        assert_eq!((result.inserts, result.updates, result.deletes), (2, 1, 1));
        assert_eq!(result.live_rows.get("Page"), Some(&1));
        assert!(!result.torn_tail);
    }

    #[test]
    fn missing_log_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(inspect(dir.path()).is_err());
    }
}
