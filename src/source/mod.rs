pub mod kafka;
pub mod memory;

pub use kafka::{KafkaGroup, KafkaPartition};
pub use memory::{MemoryGroup, MemoryGroupHandle, MemorySource, MemorySourceHandle};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("commit failed for partition {partition} at offset {offset}: {reason}")]
    Commit {
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("partition {0} is not assigned to this member")]
    PartitionUnavailable(i32),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// An undecoded message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Pull-based consumer with manual offset control.
///
/// Implementations pass payload bytes through unchanged and retry
/// connection-level failures themselves; errors returned from `poll` are
/// not expected to clear by retrying.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait up to `max_wait` for at least one message. An empty result
    /// means the wait elapsed.
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<RawMessage>, SourceError>;

    /// Record that everything up to and including `offset` on `partition`
    /// is durably stored.
    async fn commit(&mut self, partition: i32, offset: i64) -> Result<(), SourceError>;

    async fn commit_all(&mut self, offsets: &[(i32, i64)]) -> Result<(), SourceError> {
        for &(partition, offset) in offsets {
            self.commit(partition, offset).await?;
        }
        Ok(())
    }

    /// Release broker resources. Called once after the final commit.
    async fn close(&mut self) {}
}

/// Outcome of a consumer-group rebalance, as seen by one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentChange {
    Assigned(Vec<i32>),
    Revoked(Vec<i32>),
}

/// One consumer-group member. The group decides which partitions the
/// member owns; each owned partition is consumed through its own
/// [`MessageSource`].
#[async_trait]
pub trait ConsumerGroup: Send {
    /// Wait for the next rebalance outcome. `None` once the member can no
    /// longer receive assignments. Cancel safe.
    async fn next_change(&mut self) -> Option<AssignmentChange>;

    /// Source that yields only `partition`'s messages and commits only
    /// its offsets.
    fn open(&mut self, partition: i32) -> Result<Box<dyn MessageSource>, SourceError>;

    /// Leave the group. Called after every partition source has closed.
    async fn close(&mut self) {}
}
