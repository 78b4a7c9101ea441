use super::{AssignmentChange, ConsumerGroup, MessageSource, RawMessage, SourceError};
use crate::config::types::SourceConfig;
use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Forwards rebalance outcomes from librdkafka's callbacks to the member.
pub struct GroupContext {
    topic: String,
    changes: mpsc::UnboundedSender<AssignmentChange>,
}

impl GroupContext {
    fn send(&self, tpl: &TopicPartitionList, change: fn(Vec<i32>) -> AssignmentChange) {
        let partitions: Vec<i32> = tpl
            .elements_for_topic(&self.topic)
            .iter()
            .map(|elem| elem.partition())
            .collect();
        if partitions.is_empty() {
            return;
        }
        // The member only stops listening when it is shutting down
        let _ = self.changes.send(change(partitions));
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        // Revocations go out first so their pipelines can start draining
        if let Rebalance::Revoke(tpl) = rebalance {
            info!(topic = %self.topic, partitions = tpl.count(), "Partitions revoked");
            self.send(tpl, AssignmentChange::Revoked);
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                info!(topic = %self.topic, partitions = tpl.count(), "Partitions assigned");
                self.send(tpl, AssignmentChange::Assigned);
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => warn!(topic = %self.topic, error = %e, "Rebalance failed"),
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

/// Consumer-group member backed by librdkafka.
///
/// Every assigned partition is split off the shared consumer queue so it
/// can be consumed by its own pipeline. The shared queue itself is still
/// polled in the background, since rebalance callbacks and consumer errors
/// are served from it.
///
/// Auto-commit is disabled; offsets move only through each partition's
/// [`MessageSource::commit_all`].
pub struct KafkaGroup {
    consumer: Arc<GroupConsumer>,
    topic: String,
    max_poll_records: usize,
    reconnect_backoff: Duration,
    changes: mpsc::UnboundedReceiver<AssignmentChange>,
    events: JoinHandle<()>,
}

impl KafkaGroup {
    /// Join the consumer group. `member` distinguishes client ids when several
    /// members run in one process.
    ///
    /// Fails with [`SourceError::Unreachable`] if cluster metadata cannot be
    /// fetched within `connect_timeout`.
    pub async fn connect(config: &SourceConfig, member: usize) -> Result<Self, SourceError> {
        let (tx, changes) = mpsc::unbounded_channel();
        let context = GroupContext {
            topic: config.topic.clone(),
            changes: tx,
        };
        let consumer: GroupConsumer = client_config(config, member).create_with_context(context)?;
        let consumer = Arc::new(consumer);

        let metadata_client = Arc::clone(&consumer);
        let topic = config.topic.clone();
        let timeout = config.connect_timeout;
        tokio::task::spawn_blocking(move || metadata_client.fetch_metadata(Some(&topic), timeout).map(|_| ()))
            .await?
            .map_err(|e| SourceError::Unreachable(format!("{}: {}", config.brokers, e)))?;

        consumer.subscribe(&[config.topic.as_str()])?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            group_id = %config.group_id,
            member = member,
            "Subscribed to topic"
        );

        let events = tokio::spawn(serve_shared_queue(
            Arc::clone(&consumer),
            config.topic.clone(),
            config.reconnect_backoff,
        ));

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            max_poll_records: config.max_poll_records.max(1),
            reconnect_backoff: config.reconnect_backoff,
            changes,
            events,
        })
    }
}

/// Drive the shared queue. A message only lands here if it was fetched
/// before its partition was split off; the partition is rewound so the
/// message is delivered again on the split queue.
async fn serve_shared_queue(consumer: Arc<GroupConsumer>, topic: String, backoff: Duration) {
    loop {
        let position = match consumer.recv().await {
            Ok(message) => (message.partition(), message.offset()),
            Err(e) => {
                warn!(
                    topic = %topic,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Consumer error, waiting before next receive"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let (partition, offset) = position;
        warn!(topic = %topic, partition, offset, "Message reached the shared queue, rewinding partition");
        let seeker = Arc::clone(&consumer);
        let seek_topic = topic.clone();
        let seek = tokio::task::spawn_blocking(move || {
            seeker.seek(&seek_topic, partition, Offset::Offset(offset), Duration::from_secs(5))
        })
        .await;
        match seek {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(topic = %topic, partition, offset, error = %e, "Seek failed"),
            Err(e) => warn!(topic = %topic, partition, error = %e, "Seek task failed"),
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaGroup {
    async fn next_change(&mut self) -> Option<AssignmentChange> {
        self.changes.recv().await
    }

    fn open(&mut self, partition: i32) -> Result<Box<dyn MessageSource>, SourceError> {
        let queue = self
            .consumer
            .split_partition_queue(&self.topic, partition)
            .ok_or(SourceError::PartitionUnavailable(partition))?;
        debug!(topic = %self.topic, partition, "Split partition queue");

        Ok(Box::new(KafkaPartition {
            consumer: Arc::clone(&self.consumer),
            queue,
            topic: self.topic.clone(),
            partition,
            max_poll_records: self.max_poll_records,
            reconnect_backoff: self.reconnect_backoff,
        }))
    }

    async fn close(&mut self) {
        self.events.abort();
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "Unsubscribed from topic");
    }
}

/// One assigned partition, read from its own queue.
pub struct KafkaPartition {
    consumer: Arc<GroupConsumer>,
    queue: StreamPartitionQueue<GroupContext>,
    topic: String,
    partition: i32,
    max_poll_records: usize,
    reconnect_backoff: Duration,
}

fn client_config(config: &SourceConfig, member: usize) -> ClientConfig {
    let client_id = match &config.client_id {
        Some(id) => format!("{}-{}", id, member),
        None => {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.to_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "local".to_string());
            format!("logpipe-{}-{}", host, member)
        }
    };
    let backoff_ms = config.reconnect_backoff.as_millis().max(1);

    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("client.id", client_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", config.auto_offset_reset.as_str())
        .set("reconnect.backoff.ms", backoff_ms.to_string())
        .set("reconnect.backoff.max.ms", (backoff_ms * 10).to_string());

    if let Some(auth) = &config.auth {
        client
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", &auth.username)
            .set("sasl.password", &auth.password);
        if let Some(ca) = &auth.ca_certificate {
            client.set("ssl.ca.pem", ca);
        }
        if !auth.verify_certificates {
            client.set("enable.ssl.certificate.verification", "false");
        }
    }

    client
}

fn to_raw(message: &BorrowedMessage<'_>) -> RawMessage {
    RawMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

#[async_trait]
impl MessageSource for KafkaPartition {
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<RawMessage>, SourceError> {
        let deadline = Instant::now() + max_wait;
        let mut messages = Vec::new();

        loop {
            let received = match tokio::time::timeout_at(deadline, self.queue.recv()).await {
                Err(_) => return Ok(messages),
                Ok(result) => result.map(|m| to_raw(&m)),
            };

            match received {
                Ok(raw) => {
                    messages.push(raw);
                    break;
                }
                Err(e) => {
                    warn!(
                        topic = %self.topic,
                        partition = self.partition,
                        error = %e,
                        backoff_ms = self.reconnect_backoff.as_millis() as u64,
                        "Partition queue error, waiting before next receive"
                    );
                    let wake = std::cmp::min(Instant::now() + self.reconnect_backoff, deadline);
                    tokio::time::sleep_until(wake).await;
                    if Instant::now() >= deadline {
                        return Ok(messages);
                    }
                }
            }
        }

        // Take whatever else is already buffered without waiting
        while messages.len() < self.max_poll_records {
            match self.queue.recv().now_or_never().map(|r| r.map(|m| to_raw(&m))) {
                Some(Ok(raw)) => messages.push(raw),
                Some(Err(e)) => {
                    warn!(topic = %self.topic, partition = self.partition, error = %e, "Partition queue error while draining poll");
                    break;
                }
                None => break,
            }
        }

        debug!(topic = %self.topic, partition = self.partition, count = messages.len(), "Polled messages");
        Ok(messages)
    }

    async fn commit(&mut self, partition: i32, offset: i64) -> Result<(), SourceError> {
        self.commit_all(&[(partition, offset)]).await
    }

    async fn commit_all(&mut self, offsets: &[(i32, i64)]) -> Result<(), SourceError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for &(partition, offset) in offsets {
            if partition != self.partition {
                return Err(SourceError::PartitionUnavailable(partition));
            }
            // Kafka stores the next offset to read, not the last one processed
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| SourceError::Commit {
                    partition,
                    offset,
                    reason: e.to_string(),
                })?;
        }

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await??;

        debug!(topic = %self.topic, partition = self.partition, offsets = ?offsets, "Committed offsets");
        Ok(())
    }

    async fn close(&mut self) {
        debug!(topic = %self.topic, partition = self.partition, "Partition source closed");
    }
}
