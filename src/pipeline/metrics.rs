use std::time::Duration;

/// Counters kept by one coordinator over its lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub events_written: u64,
    pub batches_flushed: u64,
    /// Messages dropped by the decoder
    pub skipped: u64,
    /// Failed write attempts that were retried
    pub retries: u64,
    pub commits: u64,
    pub commit_failures: u64,
    /// Events abandoned at shutdown without a commit
    pub discarded: u64,
    pub last_flush_latency: Option<Duration>,
}

impl PipelineMetrics {
    pub fn record_flush(&mut self, events: usize, latency: Duration) {
        self.events_written += events as u64;
        self.batches_flushed += 1;
        self.last_flush_latency = Some(latency);
    }
}

/// Final summary returned when a coordinator stops cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub name: String,
    pub metrics: PipelineMetrics,
}
