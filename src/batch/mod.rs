use crate::event::LogEvent;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_BATCH_AGE: Duration = Duration::from_secs(2);

/// Decoded events collected since the last flush, in receive order.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Correlation id for log lines; not stored
    pub id: Uuid,
    pub events: Vec<LogEvent>,
}

impl Batch {
    pub fn new(events: Vec<LogEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Append the events of a later batch, keeping this batch's id.
    pub fn extend(&mut self, later: Batch) {
        self.events.extend(later.events);
    }
}

/// Single in-memory buffer with a dual count/age flush threshold.
///
/// Owned by exactly one coordinator, so it needs no locking.
#[derive(Debug)]
pub struct BatchAccumulator {
    max_size: usize,
    max_age: Duration,
    events: Vec<LogEvent>,
    first_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            max_age,
            events: Vec::with_capacity(max_size),
            first_at: None,
        }
    }

    pub fn append(&mut self, event: LogEvent) {
        if self.events.is_empty() {
            self.first_at = Some(Instant::now());
        }
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn should_flush(&self) -> bool {
        if self.events.is_empty() {
            return false;
        }
        self.events.len() >= self.max_size || self.age() >= self.max_age
    }

    /// Take every buffered event and reset to the empty state.
    pub fn drain(&mut self) -> Batch {
        self.first_at = None;
        let events = std::mem::replace(&mut self.events, Vec::with_capacity(self.max_size));
        Batch::new(events)
    }

    /// How long the next poll may block without overshooting the age deadline.
    pub fn poll_wait(&self, poll_timeout: Duration) -> Duration {
        match self.first_at {
            Some(first) => {
                let remaining = self.max_age.saturating_sub(first.elapsed());
                remaining.min(poll_timeout)
            }
            None => poll_timeout,
        }
    }

    fn age(&self) -> Duration {
        self.first_at.map(|t| t.elapsed()).unwrap_or_default()
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_BATCH_AGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogType;
    use chrono::Utc;

    fn make_event(id: &str) -> LogEvent {
        LogEvent {
            event_id: id.to_string(),
            project_id: "p".to_string(),
            deployment_id: "d".to_string(),
            log: format!("line {}", id),
            timestamp: Utc::now(),
            log_type: LogType::Info,
            step: None,
            meta: None,
        }
    }

    #[test]
    fn test_empty_never_flushes() {
        let mut acc = BatchAccumulator::new(1, Duration::ZERO);
        assert!(!acc.should_flush());
    }

    #[test]
    fn test_size_threshold() {
        let mut acc = BatchAccumulator::new(3, Duration::from_secs(60));
        acc.append(make_event("a"));
        acc.append(make_event("b"));
        assert!(!acc.should_flush());
        acc.append(make_event("c"));
        assert!(acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_threshold() {
        let mut acc = BatchAccumulator::new(100, Duration::from_secs(2));
        acc.append(make_event("a"));
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!acc.should_flush());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_measured_from_first_item() {
        let mut acc = BatchAccumulator::new(100, Duration::from_secs(2));
        acc.append(make_event("a"));
        tokio::time::advance(Duration::from_millis(1900)).await;
        acc.append(make_event("b"));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(acc.should_flush());
    }

    #[test]
    fn test_drain_preserves_order_and_resets() {
        let mut acc = BatchAccumulator::new(10, Duration::from_secs(60));
        for id in ["a", "b", "c"] {
            acc.append(make_event(id));
        }
        let batch = acc.drain();
        let ids: Vec<_> = batch.events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(acc.is_empty());
        assert!(acc.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wait_tracks_age_deadline() {
        let mut acc = BatchAccumulator::new(10, Duration::from_secs(2));
        let timeout = Duration::from_secs(1);
        assert_eq!(acc.poll_wait(timeout), timeout);

        acc.append(make_event("a"));
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(acc.poll_wait(timeout), Duration::from_millis(500));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(acc.poll_wait(timeout), Duration::ZERO);
    }

    #[test]
    fn test_batch_extend_keeps_order() {
        let mut first = Batch::new(vec![make_event("a")]);
        let id = first.id;
        first.extend(Batch::new(vec![make_event("b")]));
        assert_eq!(first.id, id);
        assert_eq!(first.len(), 2);
        assert_eq!(first.events[1].event_id, "b");
    }
}
