//! File-backed store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK           # Advisory lock, one process at a time
//! └─ commits.log    # Append-only commit frames
//! ```
//!
//! Each frame is:
//!
//! ```text
//! | magic "CGLG" (4) | version u16 LE | body length u32 LE | SHA-256 of body (32) | CBOR body |
//! ```
//!
//! Opening a store replays every frame into memory. A frame cut short at the
//! end of the log (a crash during append) is truncated away; a digest
//! mismatch anywhere is reported as corruption.

use crate::change::{ChangeSet, StoredRow};
use crate::engine::{select, StoreEngine};
use crate::error::{
    FetchError, IdentityAllocationError, PersistenceError, StoreError, StoreResult,
};
use crate::id::PermanentId;
use crate::request::FetchRequest;
use crate::schema::Schema;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes opening every commit frame.
pub const LOG_MAGIC: [u8; 4] = *b"CGLG";

/// Current frame format version.
pub const LOG_VERSION: u16 = 1;

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "commits.log";
const HEADER_LEN: usize = 4 + 2 + 4 + 32;

/// One persisted commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFrame {
    /// Position of the commit in the log, starting at 1.
    pub sequence: u64,
    /// The changes the commit applied.
    pub changes: ChangeSet,
}

/// Result of reading a commit log without opening the store.
#[derive(Debug, Clone)]
pub struct LogScan {
    /// Frames in log order.
    pub frames: Vec<CommitFrame>,
    /// Byte length covered by complete frames.
    pub valid_len: u64,
    /// Byte length of the file.
    pub total_len: u64,
}

impl LogScan {
    /// Returns true if the log ends with an incomplete frame.
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.total_len
    }
}

#[derive(Debug)]
struct LogFile {
    file: File,
    len: u64,
    next_sequence: u64,
}

/// A store persisted as an append-only commit log.
///
/// All rows are kept in memory; the log is the durable record of every
/// committed change set. `save` returns only after the frame has been
/// synced to disk.
///
/// # Example
///
/// ```no_run
/// use ctxgraph_store::{FileStore, Schema};
/// use std::path::Path;
///
/// let store = FileStore::open(Schema::new(), Path::new("graph.store")).unwrap();
/// println!("{} commits replayed", store.sequence());
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    schema: Schema,
    _lock_file: File,
    log: Mutex<LogFile>,
    rows: RwLock<BTreeMap<PermanentId, StoredRow>>,
}

impl FileStore {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The path exists and is not a directory (`InvalidLocation`)
    /// - Another process holds the lock (`Locked`)
    /// - The log is corrupted or violates the schema (`Corrupted`)
    /// - I/O errors occur
    pub fn open(schema: Schema, path: &Path) -> StoreResult<Self> {
        if path.exists() && !path.is_dir() {
            return Err(StoreError::invalid_location(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOG_FILE))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let scan = parse_frames(&bytes)?;

        if scan.has_torn_tail() {
            tracing::warn!(
                path = %path.display(),
                valid_len = scan.valid_len,
                total_len = scan.total_len,
                "truncating torn commit frame"
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(scan.valid_len))?;

        let mut rows = BTreeMap::new();
        for frame in &scan.frames {
            frame.changes.apply_to(&mut rows, &schema).map_err(|e| {
                StoreError::corrupted(format!("commit {} cannot be replayed: {e}", frame.sequence))
            })?;
        }
        let next_sequence = scan.frames.last().map_or(1, |f| f.sequence + 1);

        tracing::info!(
            path = %path.display(),
            commits = scan.frames.len(),
            rows = rows.len(),
            "opened file store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            schema,
            _lock_file: lock_file,
            log: Mutex::new(LogFile {
                file,
                len: scan.valid_len,
                next_sequence,
            }),
            rows: RwLock::new(rows),
        })
    }

    /// Reads the commit log of a store directory without locking it.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is missing, unreadable or corrupted.
    pub fn scan_log(path: &Path) -> StoreResult<LogScan> {
        let log_path = path.join(LOG_FILE);
        if !log_path.exists() {
            return Err(StoreError::invalid_location(format!(
                "no commit log at {}",
                path.display()
            )));
        }
        parse_frames(&fs::read(log_path)?)
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number of the last persisted commit (0 if none).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.log.lock().next_sequence - 1
    }

    fn append_frame(log: &mut LogFile, frame: &CommitFrame) -> Result<(), PersistenceError> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(frame, &mut body).map_err(|e| PersistenceError::Encode {
            message: e.to_string(),
        })?;
        let len = u32::try_from(body.len()).map_err(|_| PersistenceError::Encode {
            message: format!("commit of {} bytes exceeds frame limit", body.len()),
        })?;
        let digest: [u8; 32] = Sha256::digest(&body).into();

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(&LOG_MAGIC);
        buf.extend_from_slice(&LOG_VERSION.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&digest);
        buf.extend_from_slice(&body);

        let written = log
            .file
            .write_all(&buf)
            .and_then(|()| log.file.flush())
            .and_then(|()| log.file.sync_data());
        if let Err(e) = written {
            // Drop whatever part of the frame made it to disk.
            let _ = log.file.set_len(log.len);
            let _ = log.file.seek(SeekFrom::Start(log.len));
            return Err(PersistenceError::Io(e));
        }
        log.len += buf.len() as u64;
        Ok(())
    }
}

impl StoreEngine for FileStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn save(&self, changes: &ChangeSet) -> Result<(), PersistenceError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut log = self.log.lock();
        let mut rows = self.rows.write();

        // Validate against a copy of just the affected rows.
        let mut staged: BTreeMap<PermanentId, StoredRow> = changes
            .changes
            .iter()
            .filter_map(|c| rows.get(&c.id()).map(|row| (c.id(), row.clone())))
            .collect();
        changes.apply_to(&mut staged, &self.schema)?;

        let frame = CommitFrame {
            sequence: log.next_sequence,
            changes: changes.clone(),
        };
        Self::append_frame(&mut log, &frame)?;
        log.next_sequence += 1;

        for change in &changes.changes {
            let id = change.id();
            match staged.remove(&id) {
                Some(row) => {
                    rows.insert(id, row);
                }
                None => {
                    rows.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn allocate_permanent_ids(
        &self,
        entity: &str,
        count: usize,
    ) -> Result<Vec<PermanentId>, IdentityAllocationError> {
        if !self.schema.contains(entity) {
            return Err(IdentityAllocationError::UnknownEntity {
                entity: entity.to_string(),
            });
        }
        let rows = self.rows.read();
        let mut ids = Vec::with_capacity(count);
        while ids.len() < count {
            let id = PermanentId::generate();
            if !rows.contains_key(&id) && !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn fetch(&self, request: &FetchRequest) -> Result<Vec<StoredRow>, FetchError> {
        select(&self.rows.read(), &self.schema, request)
    }

    fn load(&self, id: PermanentId) -> Result<Option<StoredRow>, FetchError> {
        Ok(self.rows.read().get(&id).cloned())
    }
}

fn parse_frames(bytes: &[u8]) -> StoreResult<LogScan> {
    let mut frames = Vec::new();
    let mut cursor = 0usize;

    while bytes.len() - cursor >= HEADER_LEN {
        let header = &bytes[cursor..cursor + HEADER_LEN];
        if header[0..4] != LOG_MAGIC {
            return Err(StoreError::corrupted(format!(
                "bad frame magic at offset {cursor}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != LOG_VERSION {
            return Err(StoreError::corrupted(format!(
                "unsupported frame version {version} at offset {cursor}"
            )));
        }
        let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let body_start = cursor + HEADER_LEN;
        if bytes.len() - body_start < len {
            break;
        }
        let body = &bytes[body_start..body_start + len];
        let digest: [u8; 32] = Sha256::digest(body).into();
        if digest[..] != header[10..42] {
            return Err(StoreError::corrupted(format!(
                "digest mismatch in frame at offset {cursor}"
            )));
        }
        let frame: CommitFrame = ciborium::de::from_reader(body).map_err(|e| {
            StoreError::corrupted(format!("undecodable frame at offset {cursor}: {e}"))
        })?;
        frames.push(frame);
        cursor = body_start + len;
    }

    Ok(LogScan {
        frames,
        valid_len: cursor as u64,
        total_len: bytes.len() as u64,
    })
}
