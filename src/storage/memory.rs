use super::traits::{LogQuery, LogStore, StoreError};
use crate::batch::Batch;
use crate::event::LogEvent;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// One call to [`LogStore::write_batch`] as seen by a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub batch_id: Uuid,
    pub event_ids: Vec<String>,
    pub at: Instant,
    pub succeeded: bool,
}

/// Store held entirely in memory, with failure injection for exercising
/// the retry and shutdown paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<LogEvent>>,
    writes: Mutex<Vec<WriteRecord>>,
    failures_left: AtomicU32,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Hold every write for `delay` before completing it.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *lock(&self.write_delay) = delay;
    }

    /// Every write attempt in call order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.writes).clone()
    }

    /// All stored rows, duplicates included.
    pub fn rows(&self) -> Vec<LogEvent> {
        lock(&self.rows).clone()
    }

    /// Sizes of successful writes in order.
    pub fn flush_sizes(&self) -> Vec<usize> {
        lock(&self.writes)
            .iter()
            .filter(|w| w.succeeded)
            .map(|w| w.event_ids.len())
            .collect()
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let delay = *lock(&self.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self.take_failure();
        lock(&self.writes).push(WriteRecord {
            batch_id: batch.id,
            event_ids: batch.events.iter().map(|e| e.event_id.clone()).collect(),
            at: Instant::now(),
            succeeded: !failed,
        });
        if failed {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        lock(&self.rows).extend(batch.events.iter().cloned());
        Ok(())
    }

    async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEvent>, StoreError> {
        let mut matching: Vec<LogEvent> = lock(&self.rows)
            .iter()
            .filter(|e| e.deployment_id == query.deployment_id && e.timestamp > query.after)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });

        let mut seen = HashSet::new();
        Ok(matching
            .into_iter()
            .filter(|e| seen.insert(e.event_id.clone()))
            .take(query.limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogType;
    use chrono::{TimeZone, Utc};

    fn event(id: &str, second: u32) -> LogEvent {
        LogEvent {
            event_id: id.to_string(),
            project_id: "p1".to_string(),
            deployment_id: "d1".to_string(),
            log: "x".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, second).unwrap(),
            log_type: LogType::Info,
            step: None,
            meta: None,
        }
    }

    #[tokio::test]
    async fn test_injected_failures_then_success() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let batch = Batch::new(vec![event("e1", 1)]);

        assert!(store.write_batch(&batch).await.is_err());
        assert!(store.write_batch(&batch).await.is_err());
        assert!(store.write_batch(&batch).await.is_ok());

        let writes = store.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(
            writes.iter().map(|w| w.succeeded).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_query_dedups_and_pages() {
        let store = MemoryStore::new();
        let batch = Batch::new(vec![event("e2", 2), event("e1", 1), event("e3", 3)]);
        store.write_batch(&batch).await.unwrap();
        store.write_batch(&batch).await.unwrap();

        let all = store.query_logs(&LogQuery::new("d1")).await.unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);

        let page = store
            .query_logs(&LogQuery::new("d1").after(all[0].timestamp).limit(1))
            .await
            .unwrap();
        assert_eq!(page[0].event_id, "e2");
        assert_eq!(page.len(), 1);
        assert_eq!(store.flush_sizes(), vec![3, 3]);
    }
}
