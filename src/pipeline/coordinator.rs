use super::metrics::{PipelineMetrics, PipelineReport};
use super::offsets::{merge_marks, OffsetTracker};
use super::retry::RetryPolicy;
use crate::batch::{Batch, BatchAccumulator};
use crate::config::types::Config;
use crate::event::decode;
use crate::source::{MessageSource, RawMessage, SourceError};
use crate::storage::{LogStore, StoreError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that stop a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("store write failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Retrying,
    Draining,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Retrying => "retrying",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub poll_timeout: Duration,
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
    pub write_timeout: Duration,
    pub retry: RetryPolicy,
    /// Budget for the final flush once shutdown is requested
    pub shutdown_deadline: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_timeout: config.source.poll_timeout,
            max_batch_size: config.batch.max_size,
            max_batch_age: config.batch.max_age,
            write_timeout: config.store.write_timeout,
            retry: RetryPolicy::from_config(&config.retry),
            shutdown_deadline: config.shutdown.deadline,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            max_batch_size: crate::batch::DEFAULT_MAX_BATCH_SIZE,
            max_batch_age: crate::batch::DEFAULT_MAX_BATCH_AGE,
            write_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

/// A batch whose write was cut short by shutdown, with the offsets it covers.
struct Pending {
    batch: Batch,
    marks: Vec<(i32, i64)>,
    skipped: u64,
}

enum WriteOutcome {
    Written { retries: u32 },
    Interrupted,
}

/// Drives one partition: poll, decode, batch, write, commit.
///
/// Offsets are committed only after the batch containing them is stored,
/// so a crash at any point leads to redelivery rather than loss.
pub struct Coordinator {
    name: String,
    source: Box<dyn MessageSource>,
    store: Arc<dyn LogStore>,
    settings: PipelineSettings,
    cancel: CancellationToken,
    accumulator: BatchAccumulator,
    offsets: OffsetTracker,
    state: PipelineState,
    metrics: PipelineMetrics,
    skipped_since_flush: u64,
}

impl Coordinator {
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn MessageSource>,
        store: Arc<dyn LogStore>,
        settings: PipelineSettings,
        cancel: CancellationToken,
    ) -> Self {
        let accumulator = BatchAccumulator::new(settings.max_batch_size, settings.max_batch_age);
        Self {
            name: name.into(),
            source,
            store,
            settings,
            cancel,
            accumulator,
            offsets: OffsetTracker::new(),
            state: PipelineState::Starting,
            metrics: PipelineMetrics::default(),
            skipped_since_flush: 0,
        }
    }

    /// Run until cancelled, then drain. Returns an error only for failures
    /// that must stop the process without committing.
    pub async fn run(mut self) -> Result<PipelineReport, PipelineError> {
        info!(
            pipeline = %self.name,
            max_batch_size = self.settings.max_batch_size,
            max_batch_age_ms = self.settings.max_batch_age.as_millis() as u64,
            "Pipeline started"
        );
        self.set_state(PipelineState::Running);

        let pending = match self.ingest().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(pipeline = %self.name, error = %e, "Pipeline stopped on fatal error");
                self.source.close().await;
                self.set_state(PipelineState::Stopped);
                return Err(e);
            }
        };

        self.drain(pending).await;
        self.source.close().await;
        self.set_state(PipelineState::Stopped);

        info!(
            pipeline = %self.name,
            events_written = self.metrics.events_written,
            batches_flushed = self.metrics.batches_flushed,
            skipped = self.metrics.skipped,
            retries = self.metrics.retries,
            discarded = self.metrics.discarded,
            "Pipeline shutdown complete"
        );

        Ok(PipelineReport {
            name: self.name,
            metrics: self.metrics,
        })
    }

    fn set_state(&mut self, next: PipelineState) {
        if self.state != next {
            debug!(pipeline = %self.name, from = %self.state, to = %next, "Pipeline state change");
            self.state = next;
        }
    }

    /// Main loop. Returns the interrupted batch, if any, once cancelled.
    async fn ingest(&mut self) -> Result<Option<Pending>, PipelineError> {
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let wait = self.accumulator.poll_wait(self.settings.poll_timeout);
            let messages = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                polled = self.source.poll(wait) => polled?,
            };

            for message in messages {
                self.accept(message);
                if self.accumulator.should_flush() {
                    if let Some(pending) = self.flush().await? {
                        return Ok(Some(pending));
                    }
                }
            }

            if self.accumulator.should_flush() {
                if let Some(pending) = self.flush().await? {
                    return Ok(Some(pending));
                }
            } else if self.accumulator.is_empty() && self.offsets.has_pending() {
                // Nothing buffered: marks left by skipped messages or a failed commit
                let marks = self.offsets.take();
                debug!(pipeline = %self.name, partitions = marks.len(), "Committing offsets with no batch pending");
                self.commit(marks).await;
            }
        }
    }

    fn accept(&mut self, message: RawMessage) {
        self.offsets.record(message.partition, message.offset);

        match decode(&message.payload) {
            Ok(event) => {
                if event.is_terminal() {
                    debug!(
                        pipeline = %self.name,
                        deployment_id = %event.deployment_id,
                        "Received final log line of deployment"
                    );
                }
                self.accumulator.append(event);
            }
            Err(e) => {
                self.metrics.skipped += 1;
                self.skipped_since_flush += 1;
                warn!(
                    pipeline = %self.name,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping undecodable message"
                );
            }
        }
    }

    async fn flush(&mut self) -> Result<Option<Pending>, PipelineError> {
        let batch = self.accumulator.drain();
        let marks = self.offsets.take();
        let skipped = std::mem::take(&mut self.skipped_since_flush);
        let started = Instant::now();

        match self.write_with_retry(&batch, true).await? {
            WriteOutcome::Interrupted => Ok(Some(Pending {
                batch,
                marks,
                skipped,
            })),
            WriteOutcome::Written { retries } => {
                let latency = started.elapsed();
                self.metrics.record_flush(batch.len(), latency);
                info!(
                    pipeline = %self.name,
                    batch_id = %batch.id,
                    batch_size = batch.len(),
                    flush_latency_ms = latency.as_millis() as u64,
                    skipped = skipped,
                    retries = retries,
                    "Flushed batch"
                );
                self.commit(marks).await;
                Ok(None)
            }
        }
    }

    /// Write `batch` until it succeeds, the attempt limit is hit, or (when
    /// `interruptible`) shutdown is requested during a backoff.
    async fn write_with_retry(
        &mut self,
        batch: &Batch,
        interruptible: bool,
    ) -> Result<WriteOutcome, PipelineError> {
        let cancel = self.cancel.clone();
        let mut failures: u32 = 0;

        loop {
            match write_once(self.store.as_ref(), self.settings.write_timeout, batch).await {
                Ok(()) => {
                    if self.state == PipelineState::Retrying {
                        self.set_state(PipelineState::Running);
                    }
                    return Ok(WriteOutcome::Written { retries: failures });
                }
                Err(e) => {
                    failures += 1;
                    if !self.settings.retry.allows_retry(failures) {
                        error!(
                            pipeline = %self.name,
                            batch_id = %batch.id,
                            attempts = failures,
                            error = %e,
                            "Max write attempts exceeded"
                        );
                        return Err(PipelineError::RetriesExhausted {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }

                    self.metrics.retries += 1;
                    let backoff = self.settings.retry.backoff(failures);
                    warn!(
                        pipeline = %self.name,
                        batch_id = %batch.id,
                        attempt = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Store write failed, retrying"
                    );

                    if interruptible {
                        self.set_state(PipelineState::Retrying);
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                info!(pipeline = %self.name, batch_id = %batch.id, "Shutdown requested during write backoff");
                                return Ok(WriteOutcome::Interrupted);
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    } else {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }

    async fn commit(&mut self, marks: Vec<(i32, i64)>) {
        if marks.is_empty() {
            return;
        }
        match self.source.commit_all(&marks).await {
            Ok(()) => {
                self.metrics.commits += 1;
                debug!(pipeline = %self.name, offsets = ?marks, "Committed offsets");
            }
            Err(e) => {
                self.metrics.commit_failures += 1;
                warn!(
                    pipeline = %self.name,
                    offsets = ?marks,
                    error = %e,
                    "Offset commit failed, will retry with the next commit"
                );
                self.offsets.merge(&marks);
            }
        }
    }

    /// Final flush of everything still held, bounded by the shutdown deadline.
    async fn drain(&mut self, pending: Option<Pending>) {
        self.set_state(PipelineState::Draining);
        let deadline = Instant::now() + self.settings.shutdown_deadline;

        let remainder = self.accumulator.drain();
        let remainder_marks = self.offsets.take();
        let (batch, marks, skipped) = match pending {
            Some(mut pending) => {
                pending.batch.extend(remainder);
                (
                    pending.batch,
                    merge_marks(pending.marks, remainder_marks),
                    pending.skipped,
                )
            }
            None => (remainder, remainder_marks, 0),
        };
        let skipped = skipped + std::mem::take(&mut self.skipped_since_flush);

        if batch.is_empty() {
            self.commit(marks).await;
            return;
        }

        info!(
            pipeline = %self.name,
            batch_id = %batch.id,
            batch_size = batch.len(),
            deadline_ms = self.settings.shutdown_deadline.as_millis() as u64,
            "Draining pending events before shutdown"
        );

        let started = Instant::now();
        let result = tokio::time::timeout_at(deadline, self.write_with_retry(&batch, false)).await;
        match result {
            Ok(Ok(outcome)) => {
                // Not interruptible, so the write either landed or failed
                let retries = match outcome {
                    WriteOutcome::Written { retries } => retries,
                    WriteOutcome::Interrupted => 0,
                };
                let latency = started.elapsed();
                self.metrics.record_flush(batch.len(), latency);
                info!(
                    pipeline = %self.name,
                    batch_id = %batch.id,
                    batch_size = batch.len(),
                    flush_latency_ms = latency.as_millis() as u64,
                    skipped = skipped,
                    retries = retries,
                    "Flushed final batch"
                );
                self.commit(marks).await;
            }
            Ok(Err(e)) => {
                self.metrics.discarded += batch.len() as u64;
                error!(
                    pipeline = %self.name,
                    batch_id = %batch.id,
                    discarded = batch.len(),
                    error = %e,
                    "Discarding pending events, offsets left uncommitted"
                );
            }
            Err(_) => {
                self.metrics.discarded += batch.len() as u64;
                error!(
                    pipeline = %self.name,
                    batch_id = %batch.id,
                    discarded = batch.len(),
                    "Shutdown deadline elapsed, discarding pending events with offsets uncommitted"
                );
            }
        }
    }
}

async fn write_once(store: &dyn LogStore, timeout: Duration, batch: &Batch) -> Result<(), StoreError> {
    match tokio::time::timeout(timeout, store.write_batch(batch)).await {
        Ok(result) => result,
        // The write may still land; the retry can duplicate rows
        Err(_) => Err(StoreError::Unavailable(format!(
            "write timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogEvent;
    use crate::source::{MemorySource, MemorySourceHandle};
    use crate::storage::{LogQuery, MemoryStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            poll_timeout: Duration::from_millis(100),
            max_batch_size: 3,
            max_batch_age: Duration::from_millis(700),
            write_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                multiplier: 2,
                max_attempts: Some(3),
            },
            shutdown_deadline: Duration::from_secs(2),
        }
    }

    fn payload(id: usize) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event_id": format!("e{}", id),
            "project_id": "p1",
            "deployment_id": "d1",
            "log": format!("line {}", id),
            "timestamp": 1_740_823_200_000i64 + id as i64,
            "type": "info"
        }))
        .unwrap()
    }

    fn coordinator(
        store: Arc<dyn LogStore>,
        settings: PipelineSettings,
    ) -> (Coordinator, MemorySourceHandle, CancellationToken) {
        let (source, handle) = MemorySource::new("container-logs", 500);
        let cancel = CancellationToken::new();
        let coordinator = Coordinator::new("test", Box::new(source), store, settings, cancel.clone());
        (coordinator, handle, cancel)
    }

    /// Records how many commits were visible whenever a write was attempted.
    struct CommitWatchStore {
        inner: MemoryStore,
        handle: Mutex<Option<MemorySourceHandle>>,
        commits_seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl LogStore for CommitWatchStore {
        async fn ensure_schema(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn write_batch(&self, batch: &Batch) -> Result<(), StoreError> {
            let seen = self
                .handle
                .lock()
                .unwrap()
                .as_ref()
                .map(|h| h.commits().len())
                .unwrap_or_default();
            self.commits_seen.lock().unwrap().push(seen);
            self.inner.write_batch(batch).await
        }

        async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEvent>, StoreError> {
            self.inner.query_logs(query).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_arrival_flushes_at_max_size() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, handle, cancel) = coordinator(store.clone(), settings());
        for i in 0..10 {
            handle.push(0, payload(i));
        }

        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.flush_sizes(), vec![3, 3, 3]);
        assert_eq!(handle.commits(), vec![(0, 2), (0, 5), (0, 8)]);

        // The tenth event goes out on age
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.flush_sizes(), vec![3, 3, 3, 1]);
        assert_eq!(handle.committed(0), Some(9));

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.metrics.events_written, 10);
        assert_eq!(report.metrics.batches_flushed, 4);
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_arrivals_flush_on_age() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, handle, cancel) = coordinator(store.clone(), settings());
        let started = Instant::now();

        let producer = handle.clone();
        tokio::spawn(async move {
            for i in 0..6 {
                producer.push(0, payload(i));
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
        let task = tokio::spawn(coordinator.run());

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(store.flush_sizes(), vec![2, 2, 2]);

        let first = store.writes()[0].at.duration_since(started);
        assert!(first >= Duration::from_millis(700));
        assert!(first < Duration::from_millis(1000));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offsets_commit_only_after_successful_write() {
        let watch = Arc::new(CommitWatchStore {
            inner: MemoryStore::new(),
            handle: Mutex::new(None),
            commits_seen: Mutex::new(Vec::new()),
        });
        watch.inner.fail_next(1);
        let (coordinator, handle, cancel) = coordinator(watch.clone(), settings());
        *watch.handle.lock().unwrap() = Some(handle.clone());

        for i in 0..3 {
            handle.push(0, payload(i));
        }
        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(*watch.commits_seen.lock().unwrap(), vec![0, 0]);
        assert_eq!(handle.commits(), vec![(0, 2)]);

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.metrics.retries, 1);
        assert_eq!(report.metrics.commits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_stops_without_commit() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(u32::MAX);
        let (coordinator, handle, _cancel) = coordinator(store.clone(), settings());
        for i in 0..3 {
            handle.push(0, payload(i));
        }

        let result = coordinator.run().await;
        assert!(matches!(
            result,
            Err(PipelineError::RetriesExhausted { attempts: 3, .. })
        ));
        assert!(handle.commits().is_empty());
        assert_eq!(store.writes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_messages_are_committed() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, handle, cancel) = coordinator(store.clone(), settings());
        handle.push(0, "not json");
        handle.push(0, r#"{"event_id": "", "project_id": "p"}"#);

        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.commits(), vec![(0, 1)]);
        assert!(store.writes().is_empty());

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.metrics.skipped, 2);
        assert_eq!(report.metrics.events_written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_offsets_ride_along_with_next_flush() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, handle, cancel) = coordinator(store.clone(), settings());
        handle.push(0, payload(0));
        handle.push(0, "garbage");
        handle.push(0, payload(1));
        handle.push(0, payload(2));

        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.flush_sizes(), vec![3]);
        assert_eq!(handle.commits(), vec![(0, 3)]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_failure_rides_along_with_next_commit() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, handle, cancel) = coordinator(store.clone(), settings());
        handle.fail_next_commit(1);
        for i in 0..3 {
            handle.push(0, payload(i));
        }

        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.flush_sizes(), vec![3]);
        assert_eq!(handle.commits(), vec![(0, 2)]);

        for i in 3..6 {
            handle.push(0, payload(i));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.commits(), vec![(0, 2), (0, 5)]);

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.metrics.commit_failures, 1);
        assert_eq!(report.metrics.commits, 2);
        assert_eq!(report.metrics.batches_flushed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_partial_batch() {
        let store = Arc::new(MemoryStore::new());
        let (coordinator, handle, cancel) = coordinator(store.clone(), settings());
        handle.push(0, payload(0));
        handle.push(0, payload(1));

        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.writes().is_empty());

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.metrics.events_written, 2);
        assert_eq!(report.metrics.discarded, 0);
        assert_eq!(store.flush_sizes(), vec![2]);
        assert_eq!(handle.commits(), vec![(0, 1)]);
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deadline_discards_without_commit() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(u32::MAX);
        let mut settings = settings();
        settings.retry.max_attempts = None;
        let (coordinator, handle, cancel) = coordinator(store.clone(), settings);
        handle.push(0, payload(0));
        handle.push(0, payload(1));

        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();

        let report = task.await.unwrap().unwrap();
        assert!(cancelled_at.elapsed() >= Duration::from_secs(2));
        assert_eq!(report.metrics.discarded, 2);
        assert_eq!(report.metrics.events_written, 0);
        assert!(handle.commits().is_empty());
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_moves_batch_to_drain() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(2);
        let (coordinator, handle, cancel) = coordinator(store.clone(), settings());
        for i in 0..3 {
            handle.push(0, payload(i));
        }

        let task = tokio::spawn(coordinator.run());
        // First attempt failed at once; the coordinator now sleeps 100ms
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.writes().len(), 1);
        cancel.cancel();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.metrics.events_written, 3);
        assert_eq!(report.metrics.retries, 2);
        assert_eq!(handle.commits(), vec![(0, 2)]);
        assert_eq!(store.writes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_counts_as_failure() {
        let store = Arc::new(MemoryStore::new());
        store.set_write_delay(Some(Duration::from_secs(5)));
        let (coordinator, handle, _cancel) = coordinator(store.clone(), settings());
        for i in 0..3 {
            handle.push(0, payload(i));
        }

        let result = coordinator.run().await;
        assert!(matches!(result, Err(PipelineError::RetriesExhausted { .. })));
        assert!(handle.commits().is_empty());
    }
}
