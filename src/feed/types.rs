//! Request, response and reporting types for the coordinator.

use crate::error::{ErrorKind, FeedError};
use crate::sink::ArtifactInfo;
use crate::types::{BatchEnvelope, ChangeRecord, Position};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coordinator state machine phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ReadingCursor,
    Fetching,
    Filtering,
    Persisting,
    Committing,
    Responding,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::ReadingCursor => "reading cursor",
            Phase::Fetching => "fetching",
            Phase::Filtering => "filtering",
            Phase::Persisting => "persisting",
            Phase::Committing => "committing",
            Phase::Responding => "responding",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which position the cursor moves to after a batch with failed records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Commit to the last filtered record, even if persisting it failed.
    /// Never stalls; a failed record is not re-delivered.
    #[default]
    LastCandidate,
    /// Commit to the last record that persisted. Failed records after it are
    /// re-delivered; a permanently failing record stalls the consumer.
    LastPersisted,
}

/// A batch request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRequest {
    /// Consumer name; the configured default when absent.
    pub consumer: Option<String>,
    /// Maximum records; the configured default when absent.
    pub limit: Option<usize>,
}

impl FeedRequest {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: Some(consumer.into()),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Records and files written per second.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Throughput {
    pub records_per_second: f64,
    pub files_per_second: f64,
}

/// Per-phase timing, in milliseconds. Phases that did not run are absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub total_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_state_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_state_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_database_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_data_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_state_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput: Option<Throughput>,
}

pub(crate) fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Response to a successful batch request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub consumer: String,
    /// Cursor version before the request.
    pub from_version: u64,
    /// Source high-water-mark at fetch time.
    pub to_version: u64,
    /// Cursor version after the request.
    pub processed_up_to: u64,
    /// Cursor entity id after the request.
    pub last_entity_id: u64,
    pub has_more: bool,
    /// Records surviving the successor filter.
    pub count: usize,
    pub saved: usize,
    pub failed: usize,
    /// Whether this request moved the durable cursor.
    pub committed: bool,
    /// Names of artifacts that could not be written.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_artifacts: Vec<String>,
    /// Records covered by the reported position, in delivery order.
    pub records: Vec<ChangeRecord>,
    pub performance: Performance,
}

impl FeedResponse {
    /// Cursor position reported by this response.
    pub fn position(&self) -> Position {
        Position::new(self.processed_up_to, self.last_entity_id)
    }

    /// Strip reporting fields, keeping the delivered batch.
    pub fn into_envelope(self) -> BatchEnvelope {
        BatchEnvelope {
            from_version: self.from_version,
            to_version: self.to_version,
            records: self.records,
            has_more: self.has_more,
        }
    }
}

/// A request that aborted.
#[derive(Debug, Error)]
#[error("{consumer}: {error} (while {phase})")]
pub struct FeedFailure {
    pub consumer: String,
    /// Phase in which the request failed.
    pub phase: Phase,
    #[source]
    pub error: FeedError,
    /// Timing of the phases that completed.
    pub performance: Performance,
}

impl FeedFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Structured payload for the transport layer.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            error: "Server error".to_string(),
            kind: self.kind(),
            message: self.error.to_string(),
            consumer: self.consumer.clone(),
            phase: self.phase,
            performance: self.performance.clone(),
        }
    }
}

/// Serializable form of a [`FeedFailure`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
    pub kind: ErrorKind,
    pub message: String,
    pub consumer: String,
    pub phase: Phase,
    pub performance: Performance,
}

/// Response to a cursor reset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub consumer: String,
    pub message: String,
    pub duration_ms: u64,
}

/// Response to an artifact listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactListing {
    pub folder: String,
    pub count: usize,
    pub files: Vec<ArtifactInfo>,
    pub duration_ms: u64,
}

/// Reachability of the coordinator's collaborators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub source_ok: bool,
    pub cursor_ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
}

impl Availability {
    pub fn is_degraded(&self) -> bool {
        !(self.source_ok && self.cursor_ok)
    }
}

/// Human-readable duration for log lines.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_secs_f64() * 1000.0;
    if ms < 1000.0 {
        format!("{:.0}ms", ms)
    } else if ms < 60_000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{:.2}m", ms / 60_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.50m");
    }

    #[test]
    fn test_performance_omits_missing_phases() {
        let perf = Performance {
            total_time_ms: 12,
            read_state_ms: Some(1),
            query_database_ms: Some(10),
            ..Default::default()
        };
        let value = serde_json::to_value(&perf).unwrap();
        assert_eq!(value["totalTimeMs"], 12);
        assert_eq!(value["queryDatabaseMs"], 10);
        assert!(value.get("saveMs").is_none());
    }

    #[test]
    fn test_failure_payload() {
        let failure = FeedFailure {
            consumer: "X".into(),
            phase: Phase::Fetching,
            error: FeedError::source_unavailable("connection reset"),
            performance: Performance::default(),
        };
        let payload = failure.to_payload();
        assert_eq!(payload.kind, ErrorKind::SourceUnavailable);
        assert_eq!(payload.phase, Phase::Fetching);
        assert!(payload.message.contains("connection reset"));
        assert!(failure.to_string().contains("while fetching"));
    }

    #[test]
    fn test_envelope_keeps_batch() {
        let response = FeedResponse {
            consumer: "X".into(),
            from_version: 4,
            to_version: 9,
            processed_up_to: 6,
            last_entity_id: 1,
            has_more: false,
            count: 1,
            saved: 1,
            failed: 0,
            committed: true,
            failed_artifacts: Vec::new(),
            records: vec![ChangeRecord::new(6, 1)],
            performance: Performance::default(),
        };
        assert_eq!(response.position(), Position::new(6, 1));

        let envelope = response.into_envelope();
        assert_eq!((envelope.from_version, envelope.to_version), (4, 9));
        assert_eq!(envelope.records.len(), 1);
        assert!(!envelope.has_more);
    }

    #[test]
    fn test_commit_policy_names() {
        let policy: CommitPolicy = serde_json::from_str("\"last_candidate\"").unwrap();
        assert_eq!(policy, CommitPolicy::LastCandidate);
        assert_eq!(CommitPolicy::default(), CommitPolicy::LastCandidate);
    }
}
