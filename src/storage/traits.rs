use crate::batch::Batch;
use crate::event::{LogEvent, Meta};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Default page size of the log read contract.
pub const DEFAULT_QUERY_LIMIT: usize = 500;

/// Bulk writer and range reader over the `log_events` table.
///
/// `write_batch` is a single bulk insert and never retries; the caller owns
/// retry policy. Writes are append-only, so a retried batch may leave
/// duplicate rows; `query_logs` collapses them by `event_id`.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create the table and its ordering key if missing. Idempotent.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn write_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    /// Events of one deployment strictly after `query.after`, ascending by
    /// timestamp, one row per `event_id`.
    async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEvent>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Cursor-style read: `deployment_id = ? AND timestamp > ? ORDER BY timestamp LIMIT ?`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    pub deployment_id: String,
    pub after: DateTime<Utc>,
    pub limit: usize,
}

impl LogQuery {
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            after: DateTime::<Utc>::default(),
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn after(mut self, after: DateTime<Utc>) -> Self {
        self.after = after;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

pub(crate) fn meta_to_column(meta: &Option<Meta>) -> Result<Option<String>, serde_json::Error> {
    meta.as_ref().map(serde_json::to_string).transpose()
}

pub(crate) fn meta_from_column(column: Option<String>) -> Result<Option<Meta>, serde_json::Error> {
    column
        .filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str(&s))
        .transpose()
}
