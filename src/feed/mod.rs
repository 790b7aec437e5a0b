//! Change feed coordination.
//!
//! The coordinator serves one batch per request:
//!
//! ```text
//! Idle → ReadingCursor → Fetching → Filtering → Persisting → Committing → Responding
//!            │               │           │            │             │
//!            └───────────────┴───────────┴────────────┴─────────────┴──→ Failed
//! ```
//!
//! - Failures before persisting leave the cursor and the artifacts untouched.
//! - Per-record persist failures are counted, not fatal.
//! - A failed commit aborts the request but keeps the written artifacts;
//!   the next request re-delivers them.

mod coordinator;
mod filter;
mod types;

pub use coordinator::Coordinator;
pub use filter::{low_water_mark, strict_successors};
pub use types::{
    format_duration, ArtifactListing, Availability, CommitPolicy, ErrorPayload, FeedFailure,
    FeedRequest, FeedResponse, Performance, Phase, ResetResponse, Throughput,
};
