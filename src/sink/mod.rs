//! Durable artifact sink.
//!
//! Every delivered change is written as one immutable artifact named
//! `{entity_id}_v{version}_{YYYYMMDD_HHMMSS}.rec`. Re-delivering the same
//! change within the same second overwrites the artifact with identical
//! content; later re-deliveries produce a sibling artifact. Both are safe
//! under at-least-once delivery.

mod artifact;

pub use artifact::{artifact_name, ArtifactSink, ARTIFACT_EXTENSION};

use crate::error::Result;
use crate::types::{ChangeRecord, Timestamp};
use serde::{Deserialize, Serialize};

/// Outcome of persisting one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Saved { name: String, size: u64 },
    Failed { name: String, error: String },
}

impl PersistOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, PersistOutcome::Saved { .. })
    }

    pub fn name(&self) -> &str {
        match self {
            PersistOutcome::Saved { name, .. } | PersistOutcome::Failed { name, .. } => name,
        }
    }
}

/// Metadata about a persisted artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInfo {
    pub filename: String,
    pub size: u64,
    pub created: Timestamp,
}

/// Destination for delivered records.
pub trait RecordSink: Send + Sync {
    /// Persist one record. Failures are reported, never propagated.
    fn persist(&self, record: &ChangeRecord) -> PersistOutcome;

    /// All artifacts, newest first.
    fn list(&self) -> Result<Vec<ArtifactInfo>>;

    /// Read one artifact back.
    fn read(&self, name: &str) -> Result<ChangeRecord>;

    /// Mean size in bytes of the `sample` newest artifacts, if any exist.
    fn average_size(&self, sample: usize) -> Result<Option<u64>> {
        let sizes: Vec<u64> = self.list()?.iter().take(sample).map(|a| a.size).collect();
        if sizes.is_empty() {
            return Ok(None);
        }
        Ok(Some(sizes.iter().sum::<u64>() / sizes.len() as u64))
    }
}

impl<S: RecordSink + ?Sized> RecordSink for std::sync::Arc<S> {
    fn persist(&self, record: &ChangeRecord) -> PersistOutcome {
        (**self).persist(record)
    }

    fn list(&self) -> Result<Vec<ArtifactInfo>> {
        (**self).list()
    }

    fn read(&self, name: &str) -> Result<ChangeRecord> {
        (**self).read(name)
    }

    fn average_size(&self, sample: usize) -> Result<Option<u64>> {
        (**self).average_size(sample)
    }
}
