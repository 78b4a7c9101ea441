use super::schema::LogTable;
use super::traits::{meta_from_column, meta_to_column, LogQuery, LogStore, StoreError};
use crate::batch::Batch;
use crate::config::types::ClickHouseConfig;
use crate::event::decode::parse_timestamp_str;
use crate::event::{LogEvent, LogType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// ClickHouse over its HTTP interface.
///
/// Batches go in as one `INSERT ... FORMAT JSONEachRow` request. Query
/// values travel as `param_*` settings, never interpolated into SQL.
pub struct ClickHouseStore {
    client: reqwest::Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
    table: LogTable,
}

/// Column layout shared by inserts and reads.
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    event_id: String,
    project_id: String,
    deployment_id: String,
    log: String,
    timestamp: String,
    #[serde(rename = "type")]
    log_type: String,
    step: Option<String>,
    meta: Option<String>,
}

impl ClickHouseStore {
    pub fn new(config: &ClickHouseConfig, table: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            table: LogTable::in_database(&config.database, table)?,
        })
    }

    pub fn table(&self) -> &LogTable {
        &self.table
    }

    async fn execute(
        &self,
        query: &str,
        params: &[(String, String)],
        body: Option<String>,
    ) -> Result<String, StoreError> {
        let mut request = self
            .client
            .post(&self.url)
            .query(&[("query", query), ("date_time_input_format", "best_effort")])
            .query(params);

        if let Some(user) = &self.username {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }
        request = request.body(body.unwrap_or_default());

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }
        Ok(text)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn encode_rows(events: &[LogEvent]) -> Result<String, StoreError> {
    let mut body = String::new();
    for event in events {
        let row = Row {
            event_id: event.event_id.clone(),
            project_id: event.project_id.clone(),
            deployment_id: event.deployment_id.clone(),
            log: event.log.clone(),
            timestamp: format_timestamp(&event.timestamp),
            log_type: event.log_type.as_str().to_string(),
            step: event.step.clone(),
            meta: meta_to_column(&event.meta)?,
        };
        body.push_str(&serde_json::to_string(&row)?);
        body.push('\n');
    }
    Ok(body)
}

fn decode_rows(body: &str) -> Result<Vec<LogEvent>, StoreError> {
    let mut events = Vec::new();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let row: Row = serde_json::from_str(line)?;
        let timestamp = parse_timestamp_str(&row.timestamp)
            .map_err(|e| StoreError::Database(format!("unreadable timestamp in result: {}", e)))?;
        events.push(LogEvent {
            event_id: row.event_id,
            project_id: row.project_id,
            deployment_id: row.deployment_id,
            log: row.log,
            timestamp,
            log_type: LogType::parse_lenient(&row.log_type),
            step: row.step,
            meta: meta_from_column(row.meta)?,
        });
    }
    Ok(events)
}

#[async_trait]
impl LogStore for ClickHouseStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.execute(&self.table.clickhouse_ddl(), &[], None).await?;
        Ok(())
    }

    async fn write_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = encode_rows(&batch.events)?;
        let query = format!("INSERT INTO {} FORMAT JSONEachRow", self.table.qualified());
        self.execute(&query, &[], Some(body)).await?;
        debug!(batch_id = %batch.id, rows = batch.len(), "Inserted batch into ClickHouse");
        Ok(())
    }

    async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEvent>, StoreError> {
        let sql = format!(
            "SELECT event_id, project_id, deployment_id, log, timestamp, type, step, meta
             FROM {}
             WHERE deployment_id = {{deployment_id:String}}
               AND timestamp > {{after:DateTime64(6, 'UTC')}}
             ORDER BY timestamp ASC, event_id ASC
             LIMIT 1 BY event_id
             LIMIT {{limit:UInt64}}
             FORMAT JSONEachRow",
            self.table.qualified()
        );
        let params = vec![
            ("param_deployment_id".to_string(), query.deployment_id.clone()),
            ("param_after".to_string(), format_timestamp(&query.after)),
            ("param_limit".to_string(), query.limit.to_string()),
        ];
        let body = self.execute(&sql, &params, None).await?;
        decode_rows(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn event() -> LogEvent {
        LogEvent {
            event_id: "e1".to_string(),
            project_id: "p1".to_string(),
            deployment_id: "d1".to_string(),
            log: "npm install".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
                + chrono::Duration::milliseconds(250),
            log_type: LogType::Warn,
            step: Some("install".to_string()),
            meta: json!({"attempt": 2}).as_object().cloned(),
        }
    }

    #[test]
    fn test_timestamp_wire_format() {
        assert_eq!(format_timestamp(&event().timestamp), "2025-03-01 10:00:00.250000");
    }

    #[test]
    fn test_rows_encode_as_json_each_row() {
        let body = encode_rows(&[event(), event()]).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);

        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["type"], "warn");
        assert_eq!(row["timestamp"], "2025-03-01 10:00:00.250000");
        assert_eq!(row["meta"], "{\"attempt\":2}");
    }

    #[test]
    fn test_result_rows_decode_back_to_events() {
        let body = encode_rows(&[event()]).unwrap();
        assert_eq!(decode_rows(&body).unwrap(), vec![event()]);
        assert!(decode_rows("").unwrap().is_empty());
    }

    #[test]
    fn test_table_is_qualified_by_database() {
        let config = ClickHouseConfig {
            url: "http://localhost:8123/".to_string(),
            database: "deploys".to_string(),
            username: None,
            password: None,
        };
        let store = ClickHouseStore::new(&config, "log_events", Duration::from_secs(1)).unwrap();
        assert_eq!(store.table().qualified(), "deploys.log_events");
        assert_eq!(store.url, "http://localhost:8123");
    }

    #[tokio::test]
    async fn test_error_status_maps_to_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let response = "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom";
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let config = ClickHouseConfig {
            url: format!("http://{}", addr),
            database: "default".to_string(),
            username: Some("default".to_string()),
            password: Some("secret".to_string()),
        };
        let store = ClickHouseStore::new(&config, "log_events", Duration::from_secs(5)).unwrap();
        match store.ensure_schema().await {
            Err(StoreError::Rejected { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
