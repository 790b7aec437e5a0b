//! File-backed cursor store.

use super::{CommitOutcome, CursorStore};
use crate::error::{FeedError, Result};
use crate::types::{CursorState, Position, Timestamp};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes for the cursor file.
const CURSOR_MAGIC: &[u8; 4] = b"CUR\0";

/// Current cursor file format version.
const CURSOR_VERSION: u8 = 1;

/// Magic, version, length prefix and trailing checksum.
const FRAME_OVERHEAD: u64 = 4 + 1 + 8 + 4;

/// Cursor table stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CursorTable {
    cursors: BTreeMap<String, CursorState>,
}

/// Cursor store persisted to a single checksummed file.
///
/// The whole table is rewritten on every mutation through a temporary file
/// and an atomic rename, so a crash leaves either the old or the new table.
/// The in-memory table is only updated after the file write succeeds.
pub struct FileCursorStore {
    /// Path to the cursor file.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// In-memory table. The write lock is held across disk writes so that
    /// compare-and-advance is atomic.
    table: RwLock<CursorTable>,
}

impl FileCursorStore {
    /// Open the cursor file at `path`, creating an empty table if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(&path)?;

        let table = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            CursorTable::default()
        };

        info!(
            path = %path.display(),
            consumers = table.cursors.len(),
            "opened cursor store"
        );

        Ok(Self {
            path,
            _lock_file: lock_file,
            table: RwLock::new(table),
        })
    }

    /// Path to the cursor file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.with_extension("lock"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| FeedError::Locked)?;

        Ok(lock_file)
    }

    fn load_from_file(path: &Path) -> Result<CursorTable> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != CURSOR_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid cursor file magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != CURSOR_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported cursor file version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let available = file.metadata()?.len().saturating_sub(FRAME_OVERHEAD);
        if len > available {
            return Err(FeedError::InvalidFormat(format!(
                "cursor file body length {} exceeds the {} bytes on disk",
                len, available
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(FeedError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }

    /// Write `table` to disk. Callers hold the table write lock.
    fn save(&self, table: &CursorTable) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(table)?;
        let tmp_path = self.path.with_extension("tmp");

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(CURSOR_MAGIC)?;
            file.write_all(&[CURSOR_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Apply `mutate` to a copy of the table, persist it, then publish it.
    fn mutate<T>(&self, mutate: impl FnOnce(&mut CursorTable) -> T) -> Result<T> {
        let mut table = self.table.write();
        let mut next = table.clone();
        let out = mutate(&mut next);
        self.save(&next)?;
        *table = next;
        Ok(out)
    }
}

impl CursorStore for FileCursorStore {
    fn get(&self, consumer: &str) -> Result<Option<CursorState>> {
        Ok(self.table.read().cursors.get(consumer).cloned())
    }

    fn create(&self, consumer: &str) -> Result<CursorState> {
        if let Some(existing) = self.get(consumer)? {
            return Ok(existing);
        }

        let cursor = self.mutate(|table| {
            table
                .cursors
                .entry(consumer.to_string())
                .or_insert_with(|| CursorState::new(consumer))
                .clone()
        })?;

        info!(consumer, "provisioned cursor at origin");
        Ok(cursor)
    }

    fn commit(&self, consumer: &str, position: Position) -> Result<CommitOutcome> {
        let mut table = self.table.write();

        let stored = match table.cursors.get(consumer) {
            Some(cursor) => cursor.position(),
            None => {
                return Err(FeedError::CommitFailure {
                    consumer: consumer.to_string(),
                    message: "no cursor provisioned".into(),
                })
            }
        };

        if position <= stored {
            warn!(consumer, ?stored, requested = ?position, "rejected non-advancing commit");
            return Ok(CommitOutcome::Stale { stored });
        }

        let mut next = table.clone();
        let cursor = CursorState {
            consumer_name: consumer.to_string(),
            last_version: position.version,
            last_entity_id: position.entity_id,
            last_sync: Timestamp::now(),
        };
        next.cursors.insert(consumer.to_string(), cursor.clone());
        self.save(&next).map_err(|e| FeedError::CommitFailure {
            consumer: consumer.to_string(),
            message: e.to_string(),
        })?;
        *table = next;

        debug!(consumer, %position, "cursor advanced");
        Ok(CommitOutcome::Advanced(cursor))
    }

    fn reset(&self, consumer: &str) -> Result<CursorState> {
        let cursor = self.mutate(|table| {
            let cursor = CursorState::new(consumer);
            table.cursors.insert(consumer.to_string(), cursor.clone());
            cursor
        })?;

        info!(consumer, "cursor reset to origin");
        Ok(cursor)
    }

    fn list(&self) -> Result<Vec<CursorState>> {
        Ok(self.table.read().cursors.values().cloned().collect())
    }

    fn ping(&self) -> Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => Err(
                FeedError::cursor_unavailable(format!("{} is missing", parent.display())),
            ),
            _ => Ok(()),
        }
    }
}
