use super::{LogEvent, LogType, Meta};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("required field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Payload shape as producers send it. Everything is optional here so that
/// validation can report which field is wrong instead of a generic serde error.
#[derive(Debug, Deserialize)]
struct WireEvent {
    event_id: Option<String>,
    project_id: Option<String>,
    deployment_id: Option<String>,
    log: Option<String>,
    timestamp: Option<Value>,
    #[serde(rename = "type")]
    log_type: Option<Value>,
    step: Option<Value>,
    meta: Option<Value>,
}

/// Decode one raw topic payload into a validated [`LogEvent`].
pub fn decode(raw: &[u8]) -> Result<LogEvent, DecodeError> {
    let value: Value = serde_json::from_slice(raw)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let wire: WireEvent = serde_json::from_value(value)?;

    let event_id = required(wire.event_id, "event_id")?;
    let project_id = required(wire.project_id, "project_id")?;
    let deployment_id = required(wire.deployment_id, "deployment_id")?;
    let log = wire.log.ok_or(DecodeError::MissingField("log"))?;

    let timestamp = match wire.timestamp {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("timestamp")),
        Some(value) => parse_timestamp(&value)?,
    };

    let log_type = match wire.log_type {
        Some(Value::String(s)) => LogType::parse_lenient(&s),
        _ => LogType::Info,
    };

    let step = wire.step.and_then(normalize_step);

    Ok(LogEvent {
        event_id,
        project_id,
        deployment_id,
        log,
        timestamp,
        log_type,
        step,
        meta: wire.meta.and_then(normalize_meta),
    })
}

fn required(value: Option<String>, field: &'static str) -> Result<String, DecodeError> {
    match value {
        None => Err(DecodeError::MissingField(field)),
        Some(v) if v.trim().is_empty() => Err(DecodeError::EmptyField(field)),
        Some(v) => Ok(v),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (read as UTC), or integer
/// epoch milliseconds.
pub(crate) fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| DecodeError::InvalidTimestamp(n.to_string())),
        other => Err(DecodeError::InvalidTimestamp(other.to_string())),
    }
}

pub(crate) fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(DecodeError::InvalidTimestamp(s.to_string()))
}

/// Step is a free-form label: scalars become text, anything else is dropped.
fn normalize_step(value: Value) -> Option<String> {
    let step = match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if step.trim().is_empty() {
        None
    } else {
        Some(step)
    }
}

fn normalize_meta(value: Value) -> Option<Meta> {
    match value {
        Value::Null => None,
        Value::Object(map) => Some(map),
        // Older producers send meta pre-serialized
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Some(map),
            _ => Some(wrap_meta(Value::String(s))),
        },
        other => Some(wrap_meta(other)),
    }
}

fn wrap_meta(value: Value) -> Meta {
    let mut map = Meta::new();
    map.insert("value".to_string(), value);
    map
}
