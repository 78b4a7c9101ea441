use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::storage::schema::is_valid_identifier;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(inner) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), inner),
        )),
        other => other,
    })
}

/// Parse and validate a YAML config document, expanding `$env{...}` first.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Unset variables make the broker or store coordinates meaningless, so they
/// are rejected up front rather than passed through as literal text.
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = yaml_string
        .lines()
        .map(strip_comment)
        .flat_map(|line| env_var_pattern().captures_iter(line))
        .map(|cap| cap[1].to_string())
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

/// Commented-out lines may mention variables that are never set.
fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #") {
        Some(at) => &line[..at],
        None => line,
    }
}

fn expand_paths(config: &mut Config) {
    if let Some(duckdb) = config.store.duckdb.as_mut() {
        duckdb.path = expand_tilde(&duckdb.path);
    }
}

pub(crate) fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_source(&config.source, &mut errors);
    validate_store(&config.store, &mut errors);

    if config.batch.max_size == 0 {
        errors.push("batch.max_size must be at least 1".to_string());
    }
    if config.batch.max_age.is_zero() {
        errors.push("batch.max_age must be greater than zero".to_string());
    }

    if config.retry.initial_backoff > config.retry.max_backoff {
        errors.push(format!(
            "retry.initial_backoff ({:?}) must not exceed retry.max_backoff ({:?})",
            config.retry.initial_backoff, config.retry.max_backoff
        ));
    }
    if config.retry.max_attempts == Some(0) {
        errors.push("retry.max_attempts must be at least 1 (or null for unbounded)".to_string());
    }

    if config.pipeline.consumers == 0 {
        errors.push("pipeline.consumers must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(source: &SourceConfig, errors: &mut Vec<String>) {
    if source.brokers.trim().is_empty() {
        errors.push("source.brokers cannot be empty".to_string());
    }
    if source.topic.trim().is_empty() {
        errors.push("source.topic cannot be empty".to_string());
    }
    if source.group_id.trim().is_empty() {
        errors.push("source.group_id cannot be empty".to_string());
    }
    if source.max_poll_records == 0 {
        errors.push("source.max_poll_records must be at least 1".to_string());
    }
    if let Some(auth) = &source.auth {
        if auth.username.is_empty() {
            errors.push("source.auth.username cannot be empty".to_string());
        }
    }
}

fn validate_store(store: &StoreConfig, errors: &mut Vec<String>) {
    if !is_valid_identifier(&store.table) {
        errors.push(format!(
            "store.table '{}' is not a valid identifier (letters, digits, underscore)",
            store.table
        ));
    }

    match store.backend {
        StoreBackend::DuckDb => {
            if store.duckdb.is_none() {
                errors.push("store.backend is 'duckdb' but store.duckdb section is missing".to_string());
            }
        }
        StoreBackend::ClickHouse => match &store.clickhouse {
            None => errors.push(
                "store.backend is 'clickhouse' but store.clickhouse section is missing".to_string(),
            ),
            Some(ch) => {
                if ch.url.trim().is_empty() {
                    errors.push("store.clickhouse.url cannot be empty".to_string());
                }
                if !is_valid_identifier(&ch.database) {
                    errors.push(format!(
                        "store.clickhouse.database '{}' is not a valid identifier",
                        ch.database
                    ));
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MINIMAL: &str = r#"
source:
  brokers: localhost:9092
store:
  backend: duckdb
  duckdb:
    path: /tmp/logpipe-test.duckdb
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.source.topic, "container-logs");
        assert_eq!(config.source.group_id, "log-ingestion");
        assert_eq!(config.source.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.store.table, "log_events");
        assert_eq!(config.batch.max_size, 500);
        assert_eq!(config.batch.max_age, Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, Some(10));
        assert_eq!(config.shutdown.deadline, Duration::from_secs(10));
        assert_eq!(config.pipeline.consumers, 1);
    }

    #[test]
    fn test_durations_and_unbounded_retry() {
        let yaml = format!(
            "{}batch:\n  max_size: 3\n  max_age: 250ms\nretry:\n  max_attempts: null\n  max_backoff: 1m\n",
            MINIMAL
        );
        let config = parse_config(&yaml).unwrap();
        assert_eq!(config.batch.max_age, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.retry.max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_unexpanded_env_var_is_rejected() {
        let yaml = MINIMAL.replace("localhost:9092", "$env{LOGPIPE_SURELY_UNSET_VAR}");
        match parse_config(&yaml) {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("LOGPIPE_SURELY_UNSET_VAR")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_commented_env_vars_are_ignored() {
        let yaml = format!(
            "# password: $env{{LOGPIPE_SURELY_UNSET_VAR}}\n{}  # auth: $env{{LOGPIPE_SURELY_UNSET_VAR}}\n",
            MINIMAL
        );
        assert!(parse_config(&yaml).is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
source:
  brokers: ""
  topic: ""
store:
  backend: clickhouse
  table: "log-events; DROP"
batch:
  max_size: 0
retry:
  initial_backoff: 10s
  max_backoff: 1s
pipeline:
  consumers: 0
"#;
        match parse_config(yaml) {
            Err(ConfigError::ValidationList(errors)) => {
                assert_eq!(errors.len(), 7, "{:?}", errors);
                assert!(errors.iter().any(|e| e.contains("store.clickhouse section is missing")));
                assert!(errors.iter().any(|e| e.contains("store.table")));
            }
            other => panic!("expected validation list, got {:?}", other),
        }
    }

    #[test]
    fn test_clickhouse_section() {
        let yaml = r#"
source:
  brokers: kafka-1:9092,kafka-2:9092
  auth:
    username: svc
    password: secret
    verify_certificates: false
store:
  backend: clickhouse
  clickhouse:
    url: https://ch.example.com:8443
    database: logs
"#;
        let config = parse_config(yaml).unwrap();
        let ch = config.store.clickhouse.unwrap();
        assert_eq!(ch.database, "logs");
        assert!(ch.username.is_none());
        let auth = config.source.auth.unwrap();
        assert!(!auth.verify_certificates);
        assert!(auth.ca_certificate.is_none());
    }
}
