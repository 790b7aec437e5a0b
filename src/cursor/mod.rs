//! Durable per-consumer cursors.
//!
//! A cursor records the last composite position a named consumer has been
//! delivered. Cursors are provisioned at the origin on first use, advanced
//! only by commits that move strictly forward, and reset to the origin by
//! explicit operator action. They are never deleted.

mod store;

pub use store::FileCursorStore;

use crate::error::Result;
use crate::types::{CursorState, Position};

/// Result of a commit attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The cursor moved to the new position.
    Advanced(CursorState),
    /// The requested position was not ahead of the stored one; nothing changed.
    Stale { stored: Position },
}

impl CommitOutcome {
    pub fn is_advanced(&self) -> bool {
        matches!(self, CommitOutcome::Advanced(_))
    }
}

/// Storage for consumer cursors.
pub trait CursorStore: Send + Sync {
    /// Look up a cursor. `Ok(None)` means the consumer is unknown.
    fn get(&self, consumer: &str) -> Result<Option<CursorState>>;

    /// Provision a cursor at the origin. Returns the existing cursor if the
    /// consumer is already known.
    fn create(&self, consumer: &str) -> Result<CursorState>;

    /// Advance a cursor if `position` is strictly greater than the stored one.
    fn commit(&self, consumer: &str, position: Position) -> Result<CommitOutcome>;

    /// Force a cursor back to the origin, provisioning it if needed.
    fn reset(&self, consumer: &str) -> Result<CursorState>;

    /// All known cursors, ordered by consumer name.
    fn list(&self) -> Result<Vec<CursorState>>;

    /// Cheap reachability check.
    fn ping(&self) -> Result<()>;
}

impl<S: CursorStore + ?Sized> CursorStore for std::sync::Arc<S> {
    fn get(&self, consumer: &str) -> Result<Option<CursorState>> {
        (**self).get(consumer)
    }

    fn create(&self, consumer: &str) -> Result<CursorState> {
        (**self).create(consumer)
    }

    fn commit(&self, consumer: &str, position: Position) -> Result<CommitOutcome> {
        (**self).commit(consumer, position)
    }

    fn reset(&self, consumer: &str) -> Result<CursorState> {
        (**self).reset(consumer)
    }

    fn list(&self) -> Result<Vec<CursorState>> {
        (**self).list()
    }

    fn ping(&self) -> Result<()> {
        (**self).ping()
    }
}
