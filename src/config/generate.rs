pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGPIPE CONFIGURATION
# =============================================================================
# Consumes deployment log events from Kafka and writes them in batches to an
# analytical store. Offsets are committed only after a batch is stored, so
# every event is delivered at least once.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logpipe/config.yml
#   3. /etc/logpipe/config.yml
#
# Without a config file, logpipe reads KAFKA_BROKER, CLICKHOUSE_URL and
# friends directly from the environment.
#
# Any value may reference an environment variable as $env{NAME}. Unset
# variables are a startup error.

# =============================================================================
# SOURCE
# =============================================================================
source:
  brokers: localhost:9092
  topic: container-logs
  group_id: log-ingestion
  # Where a new consumer group starts: 'earliest' or 'latest'
  auto_offset_reset: earliest
  # Longest a single poll blocks when no messages arrive
  poll_timeout: 1s
  max_poll_records: 500
  reconnect_backoff: 1s
  # Startup metadata fetch; an unreachable broker is fatal
  connect_timeout: 10s
  # SASL/PLAIN over TLS (omit for plaintext brokers)
  # auth:
  #   username: $env{KAFKA_USER_NAME}
  #   password: $env{KAFKA_PASSWORD}
  #   ca_certificate: $env{KAFKA_CA_CERTIFICATE}
  #   verify_certificates: true

# =============================================================================
# STORE
# =============================================================================
store:
  # 'duckdb' (embedded file) or 'clickhouse' (HTTP interface)
  backend: duckdb
  table: log_events
  # Writes slower than this are treated as failed and retried
  write_timeout: 10s
  duckdb:
    path: ~/.local/share/logpipe/logs.duckdb
  # clickhouse:
  #   url: $env{CLICKHOUSE_URL}
  #   database: default
  #   username: $env{CLICKHOUSE_USER_NAME}
  #   password: $env{CLICKHOUSE_PASSWORD}

# =============================================================================
# BATCHING
# =============================================================================
# A batch is flushed when it holds max_size events or its oldest event is
# max_age old, whichever comes first.
batch:
  max_size: 500
  max_age: 2s

# =============================================================================
# RETRY
# =============================================================================
# Failed writes are retried with exponential backoff. While retrying, no new
# messages are polled and no offsets are committed.
retry:
  initial_backoff: 500ms
  max_backoff: 30s
  # null retries forever at max_backoff
  max_attempts: 10

# =============================================================================
# SHUTDOWN
# =============================================================================
# On SIGTERM/Ctrl+C the remaining batch is written within this deadline.
# If it cannot be written in time it is dropped uncommitted and will be
# redelivered on restart.
shutdown:
  deadline: 10s

pipeline:
  # Consumer-group members run by this process
  consumers: 1
"#
    .to_string()
}
