//! Feed and poller configuration.

use crate::error::{FeedError, Result};
use crate::feed::CommitPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Coordinator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedConfig {
    /// Directory receiving artifacts.
    pub artifact_dir: PathBuf,

    /// Cursor file.
    pub cursor_path: PathBuf,

    /// Consumer used when a request names none.
    pub default_consumer: String,

    /// Limit used when a request gives none.
    /// Default: 1000
    pub default_limit: usize,

    /// Requests asking for more are clamped to this.
    /// Default: 10000
    pub max_limit: usize,

    /// Which position to commit after a partially failed batch.
    pub commit_policy: CommitPolicy,

    /// Bound on a single source fetch.
    /// Default: 30s
    pub fetch_timeout_ms: u64,

    /// Bound on a whole request; checked before committing.
    /// Default: 120s
    pub request_timeout_ms: u64,

    /// Artifact read cache size (number of artifacts).
    pub artifact_cache_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("./feed-output/processed"),
            cursor_path: PathBuf::from("./feed-output/cursors.bin"),
            default_consumer: "DefaultConsumer".to_string(),
            default_limit: 1000,
            max_limit: 10_000,
            commit_policy: CommitPolicy::default(),
            fetch_timeout_ms: 30_000,
            request_timeout_ms: 120_000,
            artifact_cache_size: 256,
        }
    }
}

impl FeedConfig {
    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| FeedError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_limit == 0 || self.max_limit == 0 {
            return Err(FeedError::InvalidConfig("limits must be positive".into()));
        }
        if self.default_limit > self.max_limit {
            return Err(FeedError::InvalidConfig(format!(
                "defaultLimit {} exceeds maxLimit {}",
                self.default_limit, self.max_limit
            )));
        }
        if self.fetch_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(FeedError::InvalidConfig("timeouts must be positive".into()));
        }
        if self.default_consumer.is_empty() {
            return Err(FeedError::InvalidConfig("defaultConsumer is empty".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Poller configuration.
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Consumer name sent with every request.
    pub consumer: String,

    /// Batch size requested.
    /// Default: 100
    pub limit: usize,

    /// Period of the scheduled tick.
    /// Default: 5 minutes
    pub interval: Duration,

    /// Follow-up requests issued back to back while `hasMore` holds,
    /// before the cycle yields to the next tick.
    /// Default: 64
    pub max_immediate_continuations: usize,

    /// Pause between immediate continuations.
    /// Default: zero
    pub drain_backoff: Duration,
}

impl PollerConfig {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..Default::default()
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            consumer: "DefaultConsumer".to_string(),
            limit: 100,
            interval: Duration::from_secs(5 * 60),
            max_immediate_continuations: 64,
            drain_backoff: Duration::ZERO,
        }
    }
}
