//! Dump-log command implementation.

use ctxgraph_store::{FileStore, RowChange, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// One persisted change, flattened for output.
#[derive(Debug, Serialize)]
pub struct ChangeInfo {
    /// Commit sequence.
    pub sequence: u64,
    /// Change kind (INSERT, UPDATE, DELETE).
    pub kind: &'static str,
    /// Entity name.
    pub entity: String,
    /// Row identity.
    pub id: String,
    /// Fields written by the change.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let changes = read_changes(path, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&changes)?);
        }
        _ => {
            print_text_output(&changes);
        }
    }

    Ok(())
}

/// Flattens the first `limit` commits of the log into changes.
pub fn read_changes(
    path: &Path,
    limit: Option<usize>,
) -> Result<Vec<ChangeInfo>, Box<dyn std::error::Error>> {
    let scan = FileStore::scan_log(path)?;
    let max_commits = limit.unwrap_or(usize::MAX);

    let mut changes = Vec::new();
    for frame in scan.frames.iter().take(max_commits) {
        for change in &frame.changes.changes {
            let (kind, fields) = match change {
                RowChange::Insert { row } => ("INSERT", row.fields.clone()),
                RowChange::Update { fields, .. } => ("UPDATE", fields.clone()),
                RowChange::Delete { .. } => ("DELETE", BTreeMap::new()),
            };
            changes.push(ChangeInfo {
                sequence: frame.sequence,
                kind,
                entity: change.entity().to_string(),
                id: change.id().to_string(),
                fields,
            });
        }
    }
    Ok(changes)
}

fn print_text_output(changes: &[ChangeInfo]) {
    println!(
        "{:>8}  {:<7}  {:<12}  {:<36}  FIELDS",
        "SEQ", "KIND", "ENTITY", "ID"
    );
    println!("{}", "-".repeat(80));

    for change in changes {
        let fields = change
            .fields
            .iter()
            .map(|(name, value)| format!("{name}={value:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:>8}  {:<7}  {:<12}  {:<36}  {}",
            change.sequence, change.kind, change.entity, change.id, fields
        );
    }

    println!();
    println!("Total changes: {}", changes.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxgraph_store::{ChangeSet, StoreEngine, StoredRow};
    use ctxgraph_testkit::page_schema;
    use tempfile::tempdir;

    #[test]
    fn limit_counts_commits() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(page_schema(), dir.path()).unwrap();
            for visits in 0..3 {
                let id = store.allocate_permanent_ids("Page", 1).unwrap()[0];
                let mut row = StoredRow::new(id, "Page");
                row.fields.insert("visits".into(), Value::Integer(visits));
                store
                    .save(&ChangeSet::from(vec![RowChange::Insert { row }]))
                    .unwrap();
            }
        }

        let changes = read_changes(dir.path(), Some(2)).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].sequence, 2);
        assert_eq!(changes[1].kind, "INSERT");
        assert_eq!(changes[1].fields.get("visits"), Some(&Value::Integer(1)));
    }
}
