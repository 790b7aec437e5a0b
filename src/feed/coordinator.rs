//! The change feed coordinator.

use super::filter::{low_water_mark, strict_successors};
use super::types::{
    format_duration, millis, ArtifactListing, Availability, CommitPolicy, FeedFailure,
    FeedRequest, FeedResponse, Performance, Phase, ResetResponse, Throughput,
};
use crate::config::FeedConfig;
use crate::cursor::{CommitOutcome, CursorStore, FileCursorStore};
use crate::error::{FeedError, Result};
use crate::sink::{ArtifactSink, PersistOutcome, RecordSink};
use crate::source::{ChangeSource, SourceBatch};
use crate::types::{ChangeRecord, CursorState, Position};
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Level};

/// Artifacts sampled when logging the average artifact size.
const SIZE_SAMPLE: usize = 10;

/// Extra fetches allowed once a page has yielded some new records.
const MAX_WIDENINGS: usize = 4;

/// Bookkeeping for one in-flight request.
struct Run {
    consumer: String,
    started: Instant,
    phase: Phase,
    perf: Performance,
}

impl Run {
    fn start(consumer: String) -> Self {
        Self {
            consumer,
            started: Instant::now(),
            phase: Phase::Idle,
            perf: Performance::default(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(consumer = %self.consumer, %phase, "entering phase");
        self.phase = phase;
    }

    fn finish_timing(&mut self) -> Duration {
        let total = self.started.elapsed();
        self.perf.total_time_ms = millis(total);
        total
    }

    /// Move to `Failed`, reporting the phase the request was in.
    fn fail(&mut self, error: FeedError) -> FeedFailure {
        let total = self.finish_timing();
        let failed_in = self.phase;
        error!(
            consumer = %self.consumer,
            phase = %failed_in,
            error = %error,
            elapsed = %format_duration(total),
            "change feed request failed"
        );
        self.enter(Phase::Failed);
        FeedFailure {
            consumer: self.consumer.clone(),
            phase: failed_in,
            error,
            performance: self.perf.clone(),
        }
    }
}

fn per_second(count: usize, elapsed: Duration) -> f64 {
    let rate = count as f64 / elapsed.as_secs_f64().max(1e-6);
    (rate * 100.0).round() / 100.0
}

/// Cursor reads that fail for any reason leave the consumer unserviceable.
fn as_cursor_unavailable(e: FeedError) -> FeedError {
    match e {
        e @ FeedError::SourceUnavailable { .. } => e,
        other => FeedError::cursor_unavailable(other.to_string()),
    }
}

/// Orchestrates cursor resolution, fetch, filter, persist and commit.
///
/// Requests for the same consumer are serialized; distinct consumers run
/// concurrently. There is no transaction spanning the sink and the cursor
/// store, so a crash between persisting and committing re-delivers the
/// batch on the next request.
pub struct Coordinator {
    source: Arc<dyn ChangeSource>,
    cursors: Arc<dyn CursorStore>,
    sink: Arc<dyn RecordSink>,
    config: FeedConfig,
    /// One lock per consumer name.
    consumer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Coordinator {
    /// Build a coordinator from explicit collaborators.
    pub fn new(
        source: Arc<dyn ChangeSource>,
        cursors: Arc<dyn CursorStore>,
        sink: Arc<dyn RecordSink>,
        config: FeedConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            cursors,
            sink,
            config,
            consumer_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Build a coordinator over `source` with the file-backed cursor store
    /// and artifact sink located by `config`.
    pub fn open(config: FeedConfig, source: Arc<dyn ChangeSource>) -> Result<Self> {
        config.validate()?;
        let cursors = Arc::new(FileCursorStore::open(&config.cursor_path)?);
        let sink = Arc::new(ArtifactSink::new(
            &config.artifact_dir,
            config.artifact_cache_size,
        )?);

        info!(
            artifacts = %config.artifact_dir.display(),
            cursors = %config.cursor_path.display(),
            policy = ?config.commit_policy,
            "change feed coordinator opened"
        );

        Self::new(source, cursors, sink, config)
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    fn consumer_lock(&self, consumer: &str) -> Arc<Mutex<()>> {
        let mut locks = self.consumer_locks.lock();
        Arc::clone(
            locks
                .entry(consumer.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Serve one batch for a consumer.
    pub fn changes(&self, request: FeedRequest) -> std::result::Result<FeedResponse, FeedFailure> {
        let consumer = request
            .consumer
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.config.default_consumer.clone());
        let limit = request
            .limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit);

        let lock = self.consumer_lock(&consumer);
        let _guard = lock.lock();

        let mut run = Run::start(consumer);
        info!(consumer = %run.consumer, limit, "change feed request");

        match self.run_batch(&mut run, limit) {
            Ok(response) => Ok(response),
            Err(e) => Err(run.fail(e)),
        }
    }

    fn run_batch(&self, run: &mut Run, limit: usize) -> Result<FeedResponse> {
        // Resolve the cursor, provisioning it on first use.
        run.enter(Phase::ReadingCursor);
        let step = Instant::now();
        let existing = self
            .cursors
            .get(&run.consumer)
            .map_err(as_cursor_unavailable)?;
        run.perf.read_state_ms = Some(millis(step.elapsed()));

        let cursor = match existing {
            Some(cursor) => cursor,
            None => {
                let step = Instant::now();
                let cursor = self
                    .cursors
                    .create(&run.consumer)
                    .map_err(as_cursor_unavailable)?;
                run.perf.create_state_ms = Some(millis(step.elapsed()));
                info!(consumer = %run.consumer, "new consumer");
                cursor
            }
        };
        let from = cursor.position();
        debug!(consumer = %run.consumer, %from, "resolved cursor");

        // Fetch and filter. A full page that lost records to the boundary
        // filter is fetched again, widened by the number dropped. A full page
        // with nothing new keeps doubling until something survives or the
        // source runs dry.
        let lwm = low_water_mark(from);
        let mut request = limit;
        let mut widenings = 0;
        let mut fetch_time = Duration::ZERO;
        let mut filter_time = Duration::ZERO;
        let (mut filtered, to_version) = loop {
            run.enter(Phase::Fetching);
            let step = Instant::now();
            let batch = self.fetch_bounded(lwm, request)?;
            fetch_time += step.elapsed();
            run.perf.query_database_ms = Some(millis(fetch_time));

            run.enter(Phase::Filtering);
            let step = Instant::now();
            let fetched = batch.candidates.len();
            let page_full = fetched == request;
            let kept = strict_successors(batch.candidates, from);
            filter_time += step.elapsed();
            run.perf.parse_data_ms = Some(millis(filter_time));

            debug!(
                consumer = %run.consumer,
                low_water_mark = lwm,
                fetched,
                kept = kept.len(),
                to_version = batch.to_version,
                "filtered candidates"
            );

            if kept.len() >= limit || !page_full {
                break (kept, batch.to_version);
            }
            if kept.is_empty() {
                request = request.saturating_mul(2);
            } else if widenings >= MAX_WIDENINGS {
                break (kept, batch.to_version);
            } else {
                request = limit + (fetched - kept.len());
            }
            widenings += 1;
            debug!(consumer = %run.consumer, request, widenings, "widening fetch");
        };
        filtered.truncate(limit);
        let count = filtered.len();

        if filtered.is_empty() {
            run.enter(Phase::Responding);
            run.finish_timing();
            info!(consumer = %run.consumer, "no changes found");
            return Ok(FeedResponse {
                consumer: run.consumer.clone(),
                from_version: from.version,
                to_version,
                processed_up_to: from.version,
                last_entity_id: from.entity_id,
                has_more: false,
                count: 0,
                saved: 0,
                failed: 0,
                committed: false,
                failed_artifacts: Vec::new(),
                records: Vec::new(),
                performance: run.perf.clone(),
            });
        }

        // Persist, isolating per-record failures.
        run.enter(Phase::Persisting);
        let step = Instant::now();
        let outcomes: Vec<PersistOutcome> = filtered.iter().map(|r| self.sink.persist(r)).collect();
        let save_elapsed = step.elapsed();
        run.perf.save_ms = Some(millis(save_elapsed));

        let saved = outcomes.iter().filter(|o| o.is_saved()).count();
        let failed = count - saved;
        let failed_artifacts: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_saved())
            .map(|o| o.name().to_string())
            .collect();
        info!(
            consumer = %run.consumer,
            saved,
            failed,
            elapsed = %format_duration(save_elapsed),
            "artifacts written"
        );
        self.log_average_size();

        // Commit.
        let mut position = from;
        let mut committed = false;
        if let Some(target) = self.commit_target(&filtered, &outcomes) {
            run.enter(Phase::Committing);
            let elapsed = run.started.elapsed();
            if elapsed > self.config.request_timeout() {
                return Err(FeedError::Timeout {
                    phase: "request",
                    elapsed,
                });
            }

            let step = Instant::now();
            let outcome = self
                .cursors
                .commit(&run.consumer, target)
                .map_err(|e| match e {
                    e @ FeedError::CommitFailure { .. } => e,
                    other => FeedError::CommitFailure {
                        consumer: run.consumer.clone(),
                        message: other.to_string(),
                    },
                })?;
            run.perf.update_state_ms = Some(millis(step.elapsed()));

            match outcome {
                CommitOutcome::Advanced(cursor) => {
                    position = cursor.position();
                    committed = true;
                    info!(consumer = %run.consumer, %position, "position updated");
                }
                CommitOutcome::Stale { stored } => {
                    warn!(
                        consumer = %run.consumer,
                        %stored,
                        requested = %target,
                        "cursor already past batch"
                    );
                    position = stored;
                }
            }
        } else {
            warn!(consumer = %run.consumer, count, "no records saved; cursor unchanged");
        }

        // Respond.
        run.enter(Phase::Responding);
        let total = run.finish_timing();
        if saved > 0 {
            run.perf.throughput = Some(Throughput {
                records_per_second: per_second(saved, total),
                files_per_second: per_second(saved, save_elapsed),
            });
        }

        let records: Vec<ChangeRecord> = filtered
            .into_iter()
            .filter(|r| r.position() <= position)
            .collect();

        info!(
            consumer = %run.consumer,
            count,
            saved,
            failed,
            total = %format_duration(total),
            "change feed request complete"
        );

        Ok(FeedResponse {
            consumer: run.consumer.clone(),
            from_version: from.version,
            to_version,
            processed_up_to: position.version,
            last_entity_id: position.entity_id,
            has_more: saved > 0 && count == limit,
            count,
            saved,
            failed,
            committed,
            failed_artifacts,
            records,
            performance: run.perf.clone(),
        })
    }

    /// Position to commit after persisting, per the configured policy.
    fn commit_target(
        &self,
        filtered: &[ChangeRecord],
        outcomes: &[PersistOutcome],
    ) -> Option<Position> {
        if !outcomes.iter().any(|o| o.is_saved()) {
            return None;
        }
        match self.config.commit_policy {
            CommitPolicy::LastCandidate => filtered.last().map(|r| r.position()),
            CommitPolicy::LastPersisted => filtered
                .iter()
                .zip(outcomes)
                .filter(|(_, o)| o.is_saved())
                .last()
                .map(|(r, _)| r.position()),
        }
    }

    /// Run the source fetch on a worker thread, bounded by the fetch timeout.
    fn fetch_bounded(&self, low_water_mark: u64, limit: usize) -> Result<SourceBatch> {
        let timeout = self.config.fetch_timeout();
        let (tx, rx) = bounded(1);
        let source = Arc::clone(&self.source);
        let started = Instant::now();

        thread::Builder::new()
            .name("feed-fetch".into())
            .spawn(move || {
                let _ = tx.send(source.fetch_since(low_water_mark, limit));
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(FeedError::Timeout {
                phase: "fetch",
                elapsed: started.elapsed(),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(FeedError::source_unavailable(
                "fetch worker exited without a result",
            )),
        }
    }

    fn log_average_size(&self) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        match self.sink.average_size(SIZE_SAMPLE) {
            Ok(Some(avg)) => debug!(avg_kb = avg as f64 / 1024.0, "average artifact size"),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "could not sample artifact sizes"),
        }
    }

    /// Force a consumer back to the origin for replay.
    pub fn reset(&self, consumer: &str) -> Result<ResetResponse> {
        let started = Instant::now();
        let lock = self.consumer_lock(consumer);
        let _guard = lock.lock();

        self.cursors.reset(consumer).map_err(as_cursor_unavailable)?;
        let elapsed = started.elapsed();
        info!(consumer, elapsed = %format_duration(elapsed), "consumer reset");

        Ok(ResetResponse {
            consumer: consumer.to_string(),
            message: format!("Reset {} to version 0", consumer),
            duration_ms: millis(elapsed),
        })
    }

    /// Current cursor of a consumer, if provisioned.
    pub fn cursor(&self, consumer: &str) -> Result<Option<CursorState>> {
        self.cursors.get(consumer).map_err(as_cursor_unavailable)
    }

    /// All provisioned consumers.
    pub fn consumers(&self) -> Result<Vec<CursorState>> {
        self.cursors.list().map_err(as_cursor_unavailable)
    }

    /// List persisted artifacts, newest first.
    pub fn list_artifacts(&self) -> Result<ArtifactListing> {
        let started = Instant::now();
        let files = self.sink.list()?;
        let elapsed = started.elapsed();
        debug!(count = files.len(), elapsed = %format_duration(elapsed), "listed artifacts");

        Ok(ArtifactListing {
            folder: self.config.artifact_dir.display().to_string(),
            count: files.len(),
            files,
            duration_ms: millis(elapsed),
        })
    }

    /// Read one artifact back as structured data.
    pub fn read_artifact(&self, name: &str) -> Result<serde_json::Value> {
        let started = Instant::now();
        let record = self.sink.read(name)?;
        debug!(artifact = name, elapsed = %format_duration(started.elapsed()), "read artifact");
        Ok(serde_json::to_value(record)?)
    }

    /// Ping the change source and the cursor store.
    pub fn health(&self) -> Availability {
        let mut problems = Vec::new();
        let source_ok = match self.source.ping() {
            Ok(()) => true,
            Err(e) => {
                problems.push(e.to_string());
                false
            }
        };
        let cursor_ok = match self.cursors.ping() {
            Ok(()) => true,
            Err(e) => {
                problems.push(e.to_string());
                false
            }
        };
        if !(source_ok && cursor_ok) {
            warn!(?problems, "change feed degraded");
        }
        Availability {
            source_ok,
            cursor_ok,
            problems,
        }
    }
}
