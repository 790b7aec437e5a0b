//! In-memory change-tracked table.

use super::{ChangeSource, SourceBatch};
use crate::error::{FeedError, Result};
use crate::types::ChangeRecord;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

type Fields = serde_json::Map<String, serde_json::Value>;

#[derive(Default)]
struct TableState {
    /// Current row contents by entity id.
    rows: HashMap<u64, Fields>,
    /// Last change version per entity.
    tracked: HashMap<u64, u64>,
    /// `(version, entity_id)` of the latest change of every entity.
    changes: BTreeSet<(u64, u64)>,
    /// Highest version assigned so far.
    current_version: u64,
}

/// A mutable record table with change tracking.
///
/// Every committed mutation set receives the next version. Only the most
/// recent change per entity is tracked, so an entity updated twice shows up
/// once, at its latest version. Rows written in the same mutation set share
/// a version and are ordered by entity id.
pub struct MemoryChangeTable {
    state: RwLock<TableState>,
    open: AtomicBool,
}

impl MemoryChangeTable {
    /// Open an empty table.
    pub fn open() -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            open: AtomicBool::new(true),
        }
    }

    /// Close the handle. Reads fail with `SourceUnavailable` until reopened.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Reopen a closed handle.
    pub fn reopen(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Insert or replace one row, returning the version assigned.
    pub fn upsert(&self, entity_id: u64, fields: Fields) -> u64 {
        self.commit(vec![(entity_id, fields)])
    }

    /// Apply a set of row writes under a single version.
    pub fn commit(&self, rows: Vec<(u64, Fields)>) -> u64 {
        let mut state = self.state.write();
        state.current_version += 1;
        let version = state.current_version;

        for (entity_id, fields) in rows {
            if let Some(previous) = state.tracked.insert(entity_id, version) {
                state.changes.remove(&(previous, entity_id));
            }
            state.changes.insert((version, entity_id));
            state.rows.insert(entity_id, fields);
        }

        version
    }

    /// Current high-water-mark.
    pub fn current_version(&self) -> u64 {
        self.state.read().current_version
    }

    /// Number of rows in the table.
    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FeedError::source_unavailable("change table handle is closed"))
        }
    }
}

impl ChangeSource for MemoryChangeTable {
    fn fetch_since(&self, low_water_mark: u64, limit: usize) -> Result<SourceBatch> {
        self.ensure_open()?;

        let state = self.state.read();
        let start = match low_water_mark.checked_add(1) {
            Some(v) => v,
            None => {
                return Ok(SourceBatch {
                    candidates: Vec::new(),
                    to_version: state.current_version,
                })
            }
        };

        let candidates: Vec<ChangeRecord> = state
            .changes
            .range((start, 0)..)
            .take(limit)
            .map(|&(version, entity_id)| ChangeRecord {
                order_version: version,
                entity_id,
                fields: state.rows.get(&entity_id).cloned().unwrap_or_default(),
            })
            .collect();

        debug!(
            low_water_mark,
            limit,
            found = candidates.len(),
            to_version = state.current_version,
            "fetched change candidates"
        );

        Ok(SourceBatch {
            candidates,
            to_version: state.current_version,
        })
    }

    fn ping(&self) -> Result<()> {
        self.ensure_open()
    }
}

impl Default for MemoryChangeTable {
    fn default() -> Self {
        Self::open()
    }
}
