//! Configuration assembled from process environment, for deployments that
//! inject broker and store coordinates as variables instead of a file.

use super::parse::{validate_config, ConfigError};
use super::types::*;
use std::path::PathBuf;

const KAFKA_BROKER: &str = "KAFKA_BROKER";
const KAFKA_TOPIC: &str = "KAFKA_TOPIC";
const KAFKA_GROUP_ID: &str = "KAFKA_GROUP_ID";
const KAFKA_USER_NAME: &str = "KAFKA_USER_NAME";
const KAFKA_PASSWORD: &str = "KAFKA_PASSWORD";
const KAFKA_CA_CERTIFICATE: &str = "KAFKA_CA_CERTIFICATE";
const CLICKHOUSE_URL: &str = "CLICKHOUSE_URL";
const CLICKHOUSE_DATABASE: &str = "DATABASE";
const CLICKHOUSE_USER_NAME: &str = "CLICKHOUSE_USER_NAME";
const CLICKHOUSE_PASSWORD: &str = "CLICKHOUSE_PASSWORD";
const DUCKDB_PATH: &str = "DUCKDB_PATH";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let brokers = get(KAFKA_BROKER).ok_or(ConfigError::MissingEnv(KAFKA_BROKER))?;

        let auth = match (get(KAFKA_USER_NAME), get(KAFKA_PASSWORD)) {
            (Some(username), Some(password)) => Some(KafkaAuthConfig {
                username,
                password,
                ca_certificate: get(KAFKA_CA_CERTIFICATE).map(|c| c.trim().to_string()),
                verify_certificates: true,
            }),
            (Some(_), None) => return Err(ConfigError::MissingEnv(KAFKA_PASSWORD)),
            (None, Some(_)) => return Err(ConfigError::MissingEnv(KAFKA_USER_NAME)),
            (None, None) => None,
        };

        let source = SourceConfig {
            brokers,
            topic: get(KAFKA_TOPIC).unwrap_or_else(default_topic),
            group_id: get(KAFKA_GROUP_ID).unwrap_or_else(default_group_id),
            client_id: None,
            auth,
            auto_offset_reset: OffsetReset::Earliest,
            poll_timeout: std::time::Duration::from_secs(1),
            max_poll_records: 500,
            reconnect_backoff: std::time::Duration::from_secs(1),
            connect_timeout: std::time::Duration::from_secs(10),
        };

        let store = if let Some(url) = get(CLICKHOUSE_URL) {
            StoreConfig {
                backend: StoreBackend::ClickHouse,
                table: default_table(),
                write_timeout: std::time::Duration::from_secs(10),
                duckdb: None,
                clickhouse: Some(ClickHouseConfig {
                    url,
                    database: get(CLICKHOUSE_DATABASE).unwrap_or_else(default_database),
                    username: get(CLICKHOUSE_USER_NAME),
                    password: get(CLICKHOUSE_PASSWORD),
                }),
            }
        } else if let Some(path) = get(DUCKDB_PATH) {
            StoreConfig {
                backend: StoreBackend::DuckDb,
                table: default_table(),
                write_timeout: std::time::Duration::from_secs(10),
                duckdb: Some(DuckDbConfig {
                    path: super::expand_tilde(&PathBuf::from(path)),
                }),
                clickhouse: None,
            }
        } else {
            return Err(ConfigError::MissingEnv(CLICKHOUSE_URL));
        };

        let config = Config {
            source,
            store,
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            shutdown: ShutdownConfig::default(),
            pipeline: PipelineConfig::default(),
        };
        validate_config(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_clickhouse_from_env() {
        let config = Config::from_lookup(lookup(&[
            ("KAFKA_BROKER", "broker:9093"),
            ("KAFKA_USER_NAME", "avnadmin"),
            ("KAFKA_PASSWORD", "pw"),
            ("KAFKA_CA_CERTIFICATE", "  -----BEGIN CERTIFICATE-----\n  "),
            ("CLICKHOUSE_URL", "https://ch:8443"),
            ("DATABASE", "deployments"),
            ("CLICKHOUSE_USER_NAME", "default"),
        ]))
        .unwrap();

        assert_eq!(config.source.brokers, "broker:9093");
        let auth = config.source.auth.unwrap();
        assert_eq!(auth.ca_certificate.as_deref(), Some("-----BEGIN CERTIFICATE-----"));
        assert_eq!(config.store.backend, StoreBackend::ClickHouse);
        let ch = config.store.clickhouse.unwrap();
        assert_eq!(ch.database, "deployments");
        assert_eq!(ch.username.as_deref(), Some("default"));
        assert!(ch.password.is_none());
    }

    #[test]
    fn test_missing_broker_is_fatal() {
        let err = Config::from_lookup(lookup(&[("CLICKHOUSE_URL", "http://ch:8123")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("KAFKA_BROKER")));
    }

    #[test]
    fn test_missing_store_is_fatal() {
        let err = Config::from_lookup(lookup(&[("KAFKA_BROKER", "b:9092")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("CLICKHOUSE_URL")));
    }

    #[test]
    fn test_half_configured_auth_is_fatal() {
        let err = Config::from_lookup(lookup(&[
            ("KAFKA_BROKER", "b:9092"),
            ("KAFKA_USER_NAME", "user"),
            ("DUCKDB_PATH", "/tmp/x.duckdb"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("KAFKA_PASSWORD")));
    }

    #[test]
    fn test_duckdb_from_env() {
        let config = Config::from_lookup(lookup(&[
            ("KAFKA_BROKER", "b:9092"),
            ("KAFKA_TOPIC", "build-logs"),
            ("DUCKDB_PATH", "/tmp/x.duckdb"),
        ]))
        .unwrap();
        assert_eq!(config.source.topic, "build-logs");
        assert!(config.source.auth.is_none());
        assert_eq!(config.store.backend, StoreBackend::DuckDb);
    }
}
