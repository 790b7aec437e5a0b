//! Feed consumer loop.
//!
//! A poller asks for batches on behalf of one consumer, hands every record
//! to a [`RecordHandler`], and moves its local position only once the whole
//! batch has been handled. While the feed reports `has_more` it asks again
//! straight away, up to a bounded number of continuations; otherwise it
//! waits for the next tick.
//!
//! When the handler rejects a record, the rest of that batch (starting at
//! the rejected record) is kept and replayed before anything new is
//! requested. The coordinator has already committed past those records, so
//! they would not come back on their own.
//!
//! The local position lives in memory. A restarted poller starts from
//! wherever it is seeded (the origin by default) while the durable cursor
//! on the coordinator side keeps its own place, so records are delivered at
//! least once across restarts.

use crate::config::PollerConfig;
use crate::error::{FeedError, Result};
use crate::feed::{Coordinator, FeedRequest, FeedResponse};
use crate::types::{ChangeRecord, Position};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Something that serves feed batches.
pub trait FeedClient: Send + Sync {
    fn fetch(&self, consumer: &str, limit: usize) -> Result<FeedResponse>;
}

impl FeedClient for Coordinator {
    fn fetch(&self, consumer: &str, limit: usize) -> Result<FeedResponse> {
        self.changes(FeedRequest::new(consumer).with_limit(limit))
            .map_err(|failure| failure.error)
    }
}

impl<C: FeedClient + ?Sized> FeedClient for Arc<C> {
    fn fetch(&self, consumer: &str, limit: usize) -> Result<FeedResponse> {
        (**self).fetch(consumer, limit)
    }
}

/// Business logic run for every delivered record.
pub trait RecordHandler: Send {
    fn handle(&mut self, record: &ChangeRecord) -> Result<()>;
}

impl<F> RecordHandler for F
where
    F: FnMut(&ChangeRecord) -> Result<()> + Send,
{
    fn handle(&mut self, record: &ChangeRecord) -> Result<()> {
        self(record)
    }
}

/// Result of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollOutcome {
    pub processed: usize,
    pub position: Position,
    pub has_more: bool,
}

/// Summary of one scheduled cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Requests that succeeded.
    pub batches: usize,
    /// Records handed to the handler.
    pub records: usize,
    /// Requests issued without waiting for a tick.
    pub continuations: usize,
    /// The cycle stopped with data still pending because the continuation
    /// budget ran out.
    pub yielded: bool,
    /// Error that ended the cycle, if any.
    pub error: Option<String>,
}

/// Records of a delivered batch that the handler has not accepted yet.
struct Backlog {
    records: VecDeque<ChangeRecord>,
    /// Position reported by the batch.
    position: Position,
    has_more: bool,
}

/// Pull loop for a single consumer.
pub struct FeedPoller<C, H> {
    client: C,
    handler: H,
    config: PollerConfig,
    position: Arc<Mutex<Position>>,
    backlog: Option<Backlog>,
}

impl<C: FeedClient, H: RecordHandler> FeedPoller<C, H> {
    pub fn new(client: C, handler: H, config: PollerConfig) -> Self {
        Self {
            client,
            handler,
            config,
            position: Arc::new(Mutex::new(Position::ORIGIN)),
            backlog: None,
        }
    }

    /// Start from a known position instead of the origin.
    pub fn starting_at(self, position: Position) -> Self {
        *self.position.lock() = position;
        self
    }

    /// Last position whose batch was fully handled.
    pub fn position(&self) -> Position {
        *self.position.lock()
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Records from a rejected batch still waiting for the handler.
    pub fn pending(&self) -> usize {
        self.backlog.as_ref().map_or(0, |b| b.records.len())
    }

    /// Handle the backlog if there is one, otherwise issue one request and
    /// handle its records.
    ///
    /// The local position moves to the batch position only once every record
    /// of the batch has been handled. If a record fails, it and the records
    /// after it are kept for the next call.
    pub fn poll_once(&mut self) -> Result<PollOutcome> {
        let Backlog {
            mut records,
            position,
            has_more,
        } = match self.backlog.take() {
            Some(backlog) => {
                debug!(
                    consumer = %self.config.consumer,
                    pending = backlog.records.len(),
                    "replaying unhandled records"
                );
                backlog
            }
            None => {
                let since = self.position();
                debug!(consumer = %self.config.consumer, %since, "checking for changes");
                let response = self.client.fetch(&self.config.consumer, self.config.limit)?;
                Backlog {
                    position: response.position(),
                    has_more: response.has_more,
                    records: response.records.into(),
                }
            }
        };

        let mut processed = 0;
        while let Some(record) = records.front() {
            if let Err(e) = self.handler.handle(record) {
                let failed_at = record.position();
                let e = match e {
                    e @ FeedError::Handler(_) => e,
                    other => FeedError::Handler(other.to_string()),
                };
                warn!(
                    consumer = %self.config.consumer,
                    %failed_at,
                    pending = records.len(),
                    error = %e,
                    "handler rejected record; keeping the rest of the batch"
                );
                self.backlog = Some(Backlog {
                    records,
                    position,
                    has_more,
                });
                return Err(e);
            }
            records.pop_front();
            processed += 1;
        }

        *self.position.lock() = position;

        debug!(
            consumer = %self.config.consumer,
            processed,
            %position,
            has_more,
            "batch handled"
        );

        Ok(PollOutcome {
            processed,
            position,
            has_more,
        })
    }

    /// Poll, then keep polling while more data is pending and the
    /// continuation budget allows.
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        loop {
            match self.poll_once() {
                Ok(outcome) => {
                    report.batches += 1;
                    report.records += outcome.processed;

                    if !outcome.has_more {
                        break;
                    }
                    if report.continuations >= self.config.max_immediate_continuations {
                        report.yielded = true;
                        info!(
                            consumer = %self.config.consumer,
                            continuations = report.continuations,
                            "continuation budget spent; waiting for next tick"
                        );
                        break;
                    }

                    report.continuations += 1;
                    debug!(consumer = %self.config.consumer, "more data available, fetching next batch");
                    if !self.config.drain_backoff.is_zero() {
                        thread::sleep(self.config.drain_backoff);
                    }
                }
                Err(e) => {
                    error!(
                        consumer = %self.config.consumer,
                        error = %e,
                        "poll failed; retrying from the same position on next tick"
                    );
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        report
    }
}

impl<C, H> FeedPoller<C, H>
where
    C: FeedClient + 'static,
    H: RecordHandler + 'static,
{
    /// Run on a background thread: one cycle immediately, then one per tick.
    ///
    /// Cycles never overlap; a tick that fires during a long cycle is
    /// served after it finishes.
    pub fn spawn(mut self) -> Result<PollerHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let position = Arc::clone(&self.position);
        let consumer = self.config.consumer.clone();
        let ticker = tick(self.config.interval);

        let thread = thread::Builder::new()
            .name(format!("feed-poller-{}", consumer))
            .spawn(move || {
                info!(consumer = %self.config.consumer, interval = ?self.config.interval, "poller started");
                self.run_cycle();
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            self.run_cycle();
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                info!(consumer = %self.config.consumer, "poller stopped");
            })?;

        Ok(PollerHandle {
            consumer,
            stop: stop_tx,
            thread: Some(thread),
            position,
        })
    }
}

/// Control handle for a background poller.
pub struct PollerHandle {
    consumer: String,
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
    position: Arc<Mutex<Position>>,
}

impl PollerHandle {
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Last position whose batch was fully handled.
    pub fn position(&self) -> Position {
        *self.position.lock()
    }

    /// Stop the poller after its current cycle and wait for it.
    pub fn stop(mut self) -> Result<Position> {
        self.shutdown()?;
        Ok(self.position())
    }

    fn shutdown(&mut self) -> Result<()> {
        let _ = self.stop.try_send(());
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| FeedError::Handler(format!("poller {} panicked", self.consumer)))?;
        }
        Ok(())
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
