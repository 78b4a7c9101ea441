use super::coordinator::{Coordinator, PipelineError, PipelineSettings};
use super::metrics::PipelineReport;
use crate::source::{AssignmentChange, ConsumerGroup, MessageSource};
use crate::storage::LogStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type Outcome = (i32, Result<PipelineReport, PipelineError>);

/// One consumer-group member. Every partition the group assigns gets its
/// own [`Coordinator`], so partitions never share a batch and a write stuck
/// in retry on one partition does not hold up the others.
///
/// A revoked partition's coordinator is cancelled and drains like it would
/// on shutdown. Any coordinator failure stops the whole member.
pub struct Member {
    name: String,
    group: Box<dyn ConsumerGroup>,
    store: Arc<dyn LogStore>,
    settings: PipelineSettings,
    cancel: CancellationToken,
    running: HashMap<i32, CancellationToken>,
    stopping: HashSet<i32>,
    tasks: JoinSet<Outcome>,
    reports: Vec<PipelineReport>,
    failure: Option<PipelineError>,
}

impl Member {
    pub fn new(
        name: impl Into<String>,
        group: Box<dyn ConsumerGroup>,
        store: Arc<dyn LogStore>,
        settings: PipelineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            group,
            store,
            settings,
            cancel,
            running: HashMap::new(),
            stopping: HashSet::new(),
            tasks: JoinSet::new(),
            reports: Vec::new(),
            failure: None,
        }
    }

    /// Follow assignments until cancelled, then stop every partition
    /// pipeline and leave the group. Returns one report per pipeline.
    pub async fn run(mut self) -> Result<Vec<PipelineReport>, PipelineError> {
        info!(member = %self.name, "Member started, waiting for partition assignment");
        let cancel = self.cancel.clone();
        let mut listening = true;

        while self.failure.is_none() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => self.reap(joined),
                change = self.group.next_change(), if listening => match change {
                    Some(AssignmentChange::Assigned(partitions)) => self.assign(partitions).await,
                    Some(AssignmentChange::Revoked(partitions)) => self.revoke(&partitions),
                    None => {
                        debug!(member = %self.name, "Assignment stream ended");
                        listening = false;
                    }
                },
            }
        }

        cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined);
        }
        self.group.close().await;

        info!(member = %self.name, pipelines = self.reports.len(), "Member stopped");
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.reports),
        }
    }

    async fn assign(&mut self, partitions: Vec<i32>) {
        for partition in partitions {
            if self.running.contains_key(&partition) {
                continue;
            }
            // A partition handed back before its old pipeline finished draining
            while self.stopping.contains(&partition) && self.failure.is_none() {
                match self.tasks.join_next().await {
                    Some(joined) => self.reap(joined),
                    None => {
                        self.stopping.remove(&partition);
                    }
                }
            }
            if self.cancel.is_cancelled() {
                return;
            }

            match self.group.open(partition) {
                Ok(source) => self.spawn(partition, source),
                Err(e) => {
                    error!(member = %self.name, partition, error = %e, "Cannot open assigned partition");
                    self.fail(PipelineError::Source(e));
                    return;
                }
            }
        }

        let mut owned: Vec<i32> = self.running.keys().copied().collect();
        owned.sort_unstable();
        info!(member = %self.name, partitions = ?owned, "Partition pipelines running");
    }

    fn revoke(&mut self, partitions: &[i32]) {
        for partition in partitions {
            if let Some(token) = self.running.remove(partition) {
                token.cancel();
                self.stopping.insert(*partition);
                debug!(member = %self.name, partition, "Stopping pipeline of revoked partition");
            }
        }
    }

    fn spawn(&mut self, partition: i32, source: Box<dyn MessageSource>) {
        let token = self.cancel.child_token();
        let coordinator = Coordinator::new(
            format!("{}-p{}", self.name, partition),
            source,
            Arc::clone(&self.store),
            self.settings.clone(),
            token.clone(),
        );
        self.running.insert(partition, token);
        self.tasks.spawn(async move { (partition, coordinator.run().await) });
    }

    fn reap(&mut self, joined: Result<Outcome, JoinError>) {
        match joined {
            Ok((partition, result)) => {
                self.running.remove(&partition);
                self.stopping.remove(&partition);
                match result {
                    Ok(report) => self.reports.push(report),
                    Err(e) => {
                        error!(member = %self.name, partition, error = %e, "Partition pipeline failed, stopping member");
                        self.fail(e);
                    }
                }
            }
            Err(e) => {
                error!(member = %self.name, error = %e, "Partition pipeline task aborted");
                self.fail(PipelineError::Task(e));
            }
        }
    }

    fn fail(&mut self, e: PipelineError) {
        if self.failure.is_none() {
            self.failure = Some(e);
        }
        self.cancel.cancel();
    }
}
