use super::schema::LogTable;
use super::traits::{meta_from_column, meta_to_column, LogQuery, LogStore, StoreError};
use crate::batch::Batch;
use crate::event::{LogEvent, LogType};
use async_trait::async_trait;
use chrono::DateTime;
use duckdb::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Embedded columnar store for single-node deployments and tests.
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
    table: LogTable,
}

impl DuckDbStore {
    pub fn new<P: AsRef<Path>>(path: P, table: &str) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let table = LogTable::new(table)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            if e.to_string().contains("Could not set lock") {
                tracing::error!(path = %path.display(), "Database file is locked by another process");
            }
            StoreError::from(e)
        })?;

        tracing::info!(path = %path.display(), table = %table.qualified(), "Opened DuckDB store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
        })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory(table: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: LogTable::new(table)?,
        })
    }

    pub fn table(&self) -> &LogTable {
        &self.table
    }

    /// Total stored rows, duplicates included.
    pub async fn row_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.clone();
        let table = self.table.qualified();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok::<u64, StoreError>(count.max(0) as u64)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Database("connection lock poisoned".to_string()))
}

fn conversion_error(index: usize, ty: duckdb::types::Type, msg: String) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

#[async_trait]
impl LogStore for DuckDbStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let statements = self.table.duckdb_ddl();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            for statement in statements {
                conn.execute(&statement, [])?;
            }
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))?
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let conn = self.conn.clone();
        let table = self.table.qualified();
        let events = batch.events.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            // One transaction per batch: either every row lands or none do
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO {} (event_id, project_id, deployment_id, log, timestamp, type, step, meta)
                     VALUES (?, ?, ?, ?, make_timestamp(?::BIGINT), ?, ?, ?)",
                    table
                ))?;

                for event in &events {
                    let meta = meta_to_column(&event.meta)?;
                    stmt.execute(duckdb::params![
                        event.event_id,
                        event.project_id,
                        event.deployment_id,
                        event.log,
                        event.timestamp.timestamp_micros(),
                        event.log_type.as_str(),
                        event.step,
                        meta,
                    ])?;
                }
            }
            tx.commit()?;

            Ok::<(), StoreError>(())
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))?
    }

    async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEvent>, StoreError> {
        let conn = self.conn.clone();
        let table = self.table.qualified();
        let query = query.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT event_id, project_id, deployment_id, log, epoch_us(timestamp), type, step, meta
                 FROM (
                     SELECT *, row_number() OVER (PARTITION BY event_id ORDER BY timestamp) AS occurrence
                     FROM {}
                     WHERE deployment_id = ? AND timestamp > make_timestamp(?::BIGINT)
                 )
                 WHERE occurrence = 1
                 ORDER BY timestamp ASC, event_id ASC
                 LIMIT ?",
                table
            ))?;

            let rows = stmt.query_map(
                duckdb::params![
                    query.deployment_id,
                    query.after.timestamp_micros(),
                    query.limit as i64
                ],
                |row| {
                    let timestamp = DateTime::from_timestamp_micros(row.get::<_, i64>(4)?)
                        .ok_or_else(|| {
                            conversion_error(4, duckdb::types::Type::BigInt, "invalid timestamp".into())
                        })?;
                    let meta = meta_from_column(row.get::<_, Option<String>>(7)?).map_err(|e| {
                        conversion_error(7, duckdb::types::Type::Text, e.to_string())
                    })?;

                    Ok(LogEvent {
                        event_id: row.get(0)?,
                        project_id: row.get(1)?,
                        deployment_id: row.get(2)?,
                        log: row.get(3)?,
                        timestamp,
                        log_type: LogType::parse_lenient(&row.get::<_, String>(5)?),
                        step: row.get(6)?,
                        meta,
                    })
                },
            )?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Task join error: {}", e)))?
    }
}
