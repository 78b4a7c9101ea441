use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Defaults to `logpipe-<hostname>`
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub auth: Option<KafkaAuthConfig>,
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: OffsetReset,
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
    #[serde(with = "humantime_serde", default = "default_reconnect_backoff")]
    pub reconnect_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

pub fn default_topic() -> String {
    "container-logs".to_string()
}

pub fn default_group_id() -> String {
    "log-ingestion".to_string()
}

fn default_offset_reset() -> OffsetReset {
    OffsetReset::Earliest
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_max_poll_records() -> usize {
    500
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// SASL/PLAIN over TLS, as used by managed Kafka offerings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaAuthConfig {
    pub username: String,
    pub password: String,
    /// PEM-encoded CA certificate contents
    #[serde(default)]
    pub ca_certificate: Option<String>,
    #[serde(default = "default_verify_certificates")]
    pub verify_certificates: bool,
}

fn default_verify_certificates() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
    #[serde(default)]
    pub duckdb: Option<DuckDbConfig>,
    #[serde(default)]
    pub clickhouse: Option<ClickHouseConfig>,
}

pub fn default_table() -> String {
    "log_events".to_string()
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    DuckDb,
    ClickHouse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuckDbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

pub fn default_database() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(with = "humantime_serde", default = "default_max_age")]
    pub max_age: Duration,
}

fn default_max_size() -> usize {
    crate::batch::DEFAULT_MAX_BATCH_SIZE
}

fn default_max_age() -> Duration {
    crate::batch::DEFAULT_MAX_BATCH_AGE
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_age: default_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
    /// `null` retries forever at `max_backoff`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> Option<u32> {
    Some(10)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(with = "humantime_serde", default = "default_deadline")]
    pub deadline: Duration,
}

fn default_deadline() -> Duration {
    Duration::from_secs(10)
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            deadline: default_deadline(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of consumer-group members to run in this process
    #[serde(default = "default_consumers")]
    pub consumers: usize,
}

fn default_consumers() -> usize {
    1
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            consumers: default_consumers(),
        }
    }
}
