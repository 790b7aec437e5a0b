//! Core types for the change feed.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// Compact UTC rendering used in artifact names (`YYYYMMDD_HHMMSS`).
    pub fn compact_utc(&self) -> String {
        let secs = self.0.div_euclid(1_000_000);
        match chrono::DateTime::from_timestamp(secs, 0) {
            Some(dt) => dt.format("%Y%m%d_%H%M%S").to_string(),
            None => "00000000_000000".to_string(),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Composite ordering key `(version, entity_id)`.
///
/// Positions compare by version first; entities sharing a version are
/// ordered by id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub version: u64,
    pub entity_id: u64,
}

impl Position {
    pub const ORIGIN: Position = Position {
        version: 0,
        entity_id: 0,
    };

    pub fn new(version: u64, entity_id: u64) -> Self {
        Self { version, entity_id }
    }

    pub fn is_origin(&self) -> bool {
        *self == Self::ORIGIN
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.entity_id.cmp(&other.entity_id))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({}, {})", self.version, self.entity_id)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version {}, entity {}", self.version, self.entity_id)
    }
}

/// A single change delivered by the change source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Version assigned by the source to the mutation.
    pub order_version: u64,

    /// Identifier of the mutated entity.
    pub entity_id: u64,

    /// Domain payload fields.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ChangeRecord {
    pub fn new(order_version: u64, entity_id: u64) -> Self {
        Self {
            order_version,
            entity_id,
            fields: serde_json::Map::new(),
        }
    }

    /// Add a payload field.
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Composite key of this record.
    pub fn position(&self) -> Position {
        Position::new(self.order_version, self.entity_id)
    }
}

/// Durable position of one named consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub consumer_name: String,
    pub last_version: u64,
    pub last_entity_id: u64,
    pub last_sync: Timestamp,
}

impl CursorState {
    /// A fresh cursor at the origin.
    pub fn new(consumer_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            last_version: 0,
            last_entity_id: 0,
            last_sync: Timestamp::now(),
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.last_version, self.last_entity_id)
    }
}

/// A filtered batch as seen by the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnvelope {
    pub from_version: u64,
    /// Source high-water-mark at fetch time.
    pub to_version: u64,
    pub records: Vec<ChangeRecord>,
    pub has_more: bool,
}
