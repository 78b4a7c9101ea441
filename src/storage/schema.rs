use super::traits::{LogStore, StoreError};
use tracing::{error, info};

/// Stored columns, in insert order.
pub const COLUMNS: [&str; 8] = [
    "event_id",
    "project_id",
    "deployment_id",
    "log",
    "timestamp",
    "type",
    "step",
    "meta",
];

/// Table and database names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A validated target table, optionally qualified by database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTable {
    database: Option<String>,
    name: String,
}

impl LogTable {
    pub fn new(name: &str) -> Result<Self, StoreError> {
        if !is_valid_identifier(name) {
            return Err(StoreError::InvalidIdentifier(name.to_string()));
        }
        Ok(Self {
            database: None,
            name: name.to_string(),
        })
    }

    pub fn in_database(database: &str, name: &str) -> Result<Self, StoreError> {
        if !is_valid_identifier(database) {
            return Err(StoreError::InvalidIdentifier(database.to_string()));
        }
        let mut table = Self::new(name)?;
        table.database = Some(database.to_string());
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified(&self) -> String {
        match &self.database {
            Some(db) => format!("{}.{}", db, self.name),
            None => self.name.clone(),
        }
    }

    /// DuckDB has no sort key, so the ordering key becomes an index alongside
    /// one serving the per-deployment range scan.
    pub fn duckdb_ddl(&self) -> Vec<String> {
        let table = self.qualified();
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    event_id VARCHAR NOT NULL,
                    project_id VARCHAR NOT NULL,
                    deployment_id VARCHAR NOT NULL,
                    log VARCHAR NOT NULL,
                    timestamp TIMESTAMP NOT NULL,
                    type VARCHAR NOT NULL,
                    step VARCHAR,
                    meta VARCHAR
                )",
                table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_ordering ON {1}(project_id, deployment_id, timestamp)",
                self.name, table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_deployment ON {1}(deployment_id, timestamp)",
                self.name, table
            ),
        ]
    }

    pub fn clickhouse_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                event_id String,
                project_id String,
                deployment_id String,
                log String,
                timestamp DateTime64(6, 'UTC'),
                type LowCardinality(String),
                step Nullable(String),
                meta Nullable(String)
            )
            ENGINE = MergeTree
            PARTITION BY toYYYYMM(timestamp)
            ORDER BY (project_id, deployment_id, timestamp)",
            self.qualified()
        )
    }
}

/// Make sure the target table exists before any pipeline starts. A failure
/// here leaves nothing to ingest into and is fatal to the caller.
pub async fn prepare(store: &dyn LogStore) -> Result<(), StoreError> {
    info!("Ensuring log table schema");
    match store.ensure_schema().await {
        Ok(()) => {
            info!("Log table schema ready");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Failed to ensure log table schema");
            Err(e)
        }
    }
}
