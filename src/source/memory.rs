use super::{AssignmentChange, ConsumerGroup, MessageSource, RawMessage, SourceError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Commit log and counters shared by every source that hands out messages
/// of one topic.
#[derive(Default)]
struct Journal {
    commits: Mutex<Vec<(i32, i64)>>,
    delivered: AtomicUsize,
    closed: AtomicUsize,
    commit_failures_left: AtomicU32,
}

impl Journal {
    fn commits(&self) -> Vec<(i32, i64)> {
        lock(&self.commits).clone()
    }

    fn committed(&self, partition: i32) -> Option<i64> {
        lock(&self.commits)
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, o)| *o)
            .max()
    }

    fn take_commit_failure(&self) -> bool {
        self.commit_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-process source fed through a [`MemorySourceHandle`].
pub struct MemorySource {
    topic: String,
    rx: mpsc::UnboundedReceiver<RawMessage>,
    max_poll_records: usize,
    journal: Arc<Journal>,
}

/// Producer side and inspection of a [`MemorySource`]. Cheap to clone.
#[derive(Clone)]
pub struct MemorySourceHandle {
    topic: String,
    tx: mpsc::UnboundedSender<RawMessage>,
    next_offsets: Arc<Mutex<HashMap<i32, i64>>>,
    journal: Arc<Journal>,
}

impl MemorySource {
    pub fn new(topic: &str, max_poll_records: usize) -> (Self, MemorySourceHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let journal = Arc::new(Journal::default());
        let handle = MemorySourceHandle {
            topic: topic.to_string(),
            tx,
            next_offsets: Arc::new(Mutex::new(HashMap::new())),
            journal: Arc::clone(&journal),
        };
        let source = Self {
            topic: topic.to_string(),
            rx,
            max_poll_records: max_poll_records.max(1),
            journal,
        };
        (source, handle)
    }
}

impl MemorySourceHandle {
    /// Enqueue a payload on `partition`, returning the offset it was given.
    pub fn push(&self, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = {
            let mut offsets = lock(&self.next_offsets);
            let next = offsets.entry(partition).or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };
        // The receiver only goes away with the source; late pushes are moot
        let _ = self.tx.send(RawMessage {
            topic: self.topic.clone(),
            partition,
            offset,
            payload: payload.into(),
        });
        offset
    }

    /// Every successful commit in order, as `(partition, offset)`.
    pub fn commits(&self) -> Vec<(i32, i64)> {
        self.journal.commits()
    }

    /// Highest committed offset for `partition`.
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.journal.committed(partition)
    }

    /// Number of messages handed out by `poll` so far.
    pub fn delivered(&self) -> usize {
        self.journal.delivered.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.journal.closed.load(Ordering::SeqCst) > 0
    }

    /// Make the next `n` commit calls fail without recording anything.
    pub fn fail_next_commit(&self, n: u32) {
        self.journal.commit_failures_left.store(n, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<RawMessage>, SourceError> {
        let first = match tokio::time::timeout(max_wait, self.rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                // All handles dropped; behave like an idle topic
                tokio::time::sleep(max_wait).await;
                return Ok(Vec::new());
            }
            Err(_) => return Ok(Vec::new()),
        };

        let mut messages = vec![first];
        while messages.len() < self.max_poll_records {
            match self.rx.try_recv() {
                Ok(message) => messages.push(message),
                Err(_) => break,
            }
        }

        self.journal.delivered.fetch_add(messages.len(), Ordering::SeqCst);
        Ok(messages)
    }

    async fn commit(&mut self, partition: i32, offset: i64) -> Result<(), SourceError> {
        if self.journal.take_commit_failure() {
            return Err(SourceError::Commit {
                partition,
                offset,
                reason: "injected commit failure".to_string(),
            });
        }
        lock(&self.journal.commits).push((partition, offset));
        tracing::debug!(topic = %self.topic, partition, offset, "Committed offset");
        Ok(())
    }

    async fn close(&mut self) {
        self.journal.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Per-partition channel. The receiver is parked here until the partition
/// is opened.
struct Slot {
    tx: mpsc::UnboundedSender<RawMessage>,
    rx: Option<mpsc::UnboundedReceiver<RawMessage>>,
    next_offset: i64,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            next_offset: 0,
        }
    }
}

type Slots = Arc<Mutex<HashMap<i32, Slot>>>;

/// In-process consumer-group member whose assignments are driven by a
/// [`MemoryGroupHandle`].
pub struct MemoryGroup {
    topic: String,
    max_poll_records: usize,
    changes: mpsc::UnboundedReceiver<AssignmentChange>,
    slots: Slots,
    journal: Arc<Journal>,
    closed: Arc<AtomicBool>,
}

/// Rebalance trigger, producer side and inspection of a [`MemoryGroup`].
#[derive(Clone)]
pub struct MemoryGroupHandle {
    topic: String,
    changes: mpsc::UnboundedSender<AssignmentChange>,
    slots: Slots,
    journal: Arc<Journal>,
    closed: Arc<AtomicBool>,
}

impl MemoryGroup {
    pub fn new(topic: &str, max_poll_records: usize) -> (Self, MemoryGroupHandle) {
        let (tx, changes) = mpsc::unbounded_channel();
        let slots: Slots = Arc::new(Mutex::new(HashMap::new()));
        let journal = Arc::new(Journal::default());
        let closed = Arc::new(AtomicBool::new(false));

        let handle = MemoryGroupHandle {
            topic: topic.to_string(),
            changes: tx,
            slots: Arc::clone(&slots),
            journal: Arc::clone(&journal),
            closed: Arc::clone(&closed),
        };
        let group = Self {
            topic: topic.to_string(),
            max_poll_records: max_poll_records.max(1),
            changes,
            slots,
            journal,
            closed,
        };
        (group, handle)
    }
}

impl MemoryGroupHandle {
    pub fn assign(&self, partitions: &[i32]) {
        let _ = self.changes.send(AssignmentChange::Assigned(partitions.to_vec()));
    }

    pub fn revoke(&self, partitions: &[i32]) {
        let _ = self.changes.send(AssignmentChange::Revoked(partitions.to_vec()));
    }

    /// Enqueue a payload on `partition`, returning the offset it was given.
    pub fn push(&self, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(partition).or_insert_with(Slot::new);
        let offset = slot.next_offset;
        slot.next_offset += 1;
        let _ = slot.tx.send(RawMessage {
            topic: self.topic.clone(),
            partition,
            offset,
            payload: payload.into(),
        });
        offset
    }

    pub fn commits(&self) -> Vec<(i32, i64)> {
        self.journal.commits()
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.journal.committed(partition)
    }

    pub fn delivered(&self) -> usize {
        self.journal.delivered.load(Ordering::SeqCst)
    }

    /// Partition sources closed so far.
    pub fn closed_partitions(&self) -> usize {
        self.journal.closed.load(Ordering::SeqCst)
    }

    /// Whether the member itself has left the group.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next_commit(&self, n: u32) {
        self.journal.commit_failures_left.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsumerGroup for MemoryGroup {
    async fn next_change(&mut self) -> Option<AssignmentChange> {
        self.changes.recv().await
    }

    fn open(&mut self, partition: i32) -> Result<Box<dyn MessageSource>, SourceError> {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(partition).or_insert_with(Slot::new);
        let rx = match slot.rx.take() {
            Some(rx) => rx,
            None => {
                // Reopened after a revoke; later pushes go to the new channel
                let (tx, rx) = mpsc::unbounded_channel();
                slot.tx = tx;
                rx
            }
        };

        Ok(Box::new(MemorySource {
            topic: self.topic.clone(),
            rx,
            max_poll_records: self.max_poll_records,
            journal: Arc::clone(&self.journal),
        }))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
