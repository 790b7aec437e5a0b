//! Change source adapters.
//!
//! A change source is a read-only view over an external mutation log. Given
//! a low-water-mark it returns the changes recorded after that version,
//! ordered by composite key, together with the source's current
//! high-water-mark.
//!
//! Sources follow a boundary-inclusive convention from the caller's point
//! of view: the coordinator lowers its low-water-mark by one before asking,
//! so records exactly at the cursor version come back and must be
//! re-filtered.

mod table;

pub use table::MemoryChangeTable;

use crate::error::Result;
use crate::types::ChangeRecord;

/// Candidates returned by a single fetch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceBatch {
    /// Candidates in ascending `(version, entity_id)` order.
    pub candidates: Vec<ChangeRecord>,
    /// Source high-water-mark at fetch time.
    pub to_version: u64,
}

/// Read-only query over an external change log.
pub trait ChangeSource: Send + Sync {
    /// Fetch up to `limit` changes recorded after `low_water_mark`.
    ///
    /// Fails with `SourceUnavailable` when the source cannot be reached.
    fn fetch_since(&self, low_water_mark: u64, limit: usize) -> Result<SourceBatch>;

    /// Cheap reachability check.
    fn ping(&self) -> Result<()>;
}

impl<S: ChangeSource + ?Sized> ChangeSource for std::sync::Arc<S> {
    fn fetch_since(&self, low_water_mark: u64, limit: usize) -> Result<SourceBatch> {
        (**self).fetch_since(low_water_mark, limit)
    }

    fn ping(&self) -> Result<()> {
        (**self).ping()
    }
}
