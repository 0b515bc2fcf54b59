//! Verify command implementation.

use ctxgraph_store::{FileStore, PermanentId, RowChange};
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of commits checked.
    pub commits_checked: usize,
    /// Bytes after the last complete commit.
    pub torn_tail_bytes: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let result = verify(path);
    println!("Commits checked: {}", result.commits_checked);
    if result.torn_tail_bytes > 0 {
        println!(
            "Warning: {} trailing bytes of an incomplete commit (dropped on next open)",
            result.torn_tail_bytes
        );
    }
    for error in &result.errors {
        println!("  Error: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Checks frame integrity, sequence continuity and row lifecycles.
pub fn verify(path: &Path) -> VerifyResult {
    let mut result = VerifyResult::default();
    let scan = match FileStore::scan_log(path) {
        Ok(scan) => scan,
        Err(err) => {
            result.errors.push(err.to_string());
            return result;
        }
    };
    result.torn_tail_bytes = scan.total_len - scan.valid_len;

    let mut live: HashSet<PermanentId> = HashSet::new();
    for (index, frame) in scan.frames.iter().enumerate() {
        result.commits_checked += 1;
        let expected = index as u64 + 1;
        if frame.sequence != expected {
            result.errors.push(format!(
                "commit {} found where sequence {expected} was expected",
                frame.sequence
            ));
        }
        for change in &frame.changes.changes {
            match change {
                RowChange::Insert { row } => {
                    if !live.insert(row.id) {
                        result.errors.push(format!(
                            "commit {} inserts {} twice",
                            frame.sequence, row.id
                        ));
                    }
                }
                RowChange::Update { id, .. } => {
                    if !live.contains(id) {
                        result.errors.push(format!(
                            "commit {} updates missing row {id}",
                            frame.sequence
                        ));
                    }
                }
                RowChange::Delete { id, .. } => {
                    if !live.remove(id) {
                        result.errors.push(format!(
                            "commit {} deletes missing row {id}",
                            frame.sequence
                        ));
                    }
                }
            }
        }
    }

    result
}
