//! # Change Feed
//!
//! A pull-based change feed over a mutating record store. Named consumers
//! ask for the changes since their last position; the feed persists each
//! change as a durable artifact and advances a per-consumer cursor only
//! after the batch has been written.
//!
//! ## Core Concepts
//!
//! - **Change source**: read-only view over a mutation log, ordered by
//!   `(version, entity_id)`
//! - **Cursor**: durable per-consumer position, advanced strictly forward
//! - **Artifact**: one immutable, deterministically named file per change
//! - **Coordinator**: the cursor → fetch → filter → persist → commit cycle
//! - **Poller**: the consumer-side loop with eager draining
//!
//! Delivery is at-least-once: a crash between persisting and committing
//! re-delivers the batch, and artifacts tolerate being written again.
//!
//! ## Example
//!
//! ```ignore
//! use changefeed::{Coordinator, FeedConfig, FeedRequest, MemoryChangeTable};
//! use std::sync::Arc;
//!
//! let table = Arc::new(MemoryChangeTable::open());
//! let coordinator = Coordinator::open(FeedConfig::default(), table.clone())?;
//!
//! table.upsert(42, serde_json::Map::new());
//!
//! let response = coordinator.changes(FeedRequest::new("billing").with_limit(100))?;
//! println!("{} new, cursor at {}", response.count, response.processed_up_to);
//! ```

pub mod config;
pub mod cursor;
pub mod error;
pub mod feed;
pub mod poller;
pub mod sink;
pub mod source;
pub mod types;

// Re-exports
pub use config::{FeedConfig, PollerConfig};
pub use cursor::{CommitOutcome, CursorStore, FileCursorStore};
pub use error::{ErrorKind, FeedError, Result};
pub use feed::{
    format_duration, low_water_mark, strict_successors, ArtifactListing, Availability,
    CommitPolicy, Coordinator, ErrorPayload, FeedFailure, FeedRequest, FeedResponse, Performance,
    Phase, ResetResponse, Throughput,
};
pub use poller::{CycleReport, FeedClient, FeedPoller, PollOutcome, PollerHandle, RecordHandler};
pub use sink::{artifact_name, ArtifactInfo, ArtifactSink, PersistOutcome, RecordSink};
pub use source::{ChangeSource, MemoryChangeTable, SourceBatch};
pub use types::*;
