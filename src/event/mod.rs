pub mod decode;

pub use decode::{decode, DecodeError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Free-form structured metadata attached to a log line.
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// Log lines that the viewer treats as the end of a deployment's stream.
const COMPLETION_MARKERS: &[&str] = &["deployment completed", "successfully"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    #[default]
    Info,
    Warn,
    Error,
    Success,
}

impl LogType {
    /// Parse a producer-supplied type. Unknown values fall back to `Info`
    /// so new producer levels never cause a message to be rejected.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "warn" | "warning" => LogType::Warn,
            "error" => LogType::Error,
            "success" => LogType::Success,
            _ => LogType::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Info => "info",
            LogType::Warn => "warn",
            LogType::Error => "error",
            LogType::Success => "success",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A single deployment log line, as decoded from the topic and stored in
/// the `log_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Producer-assigned id; duplicates of the same id are the same event
    pub event_id: String,
    pub project_id: String,
    pub deployment_id: String,
    pub log: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub step: Option<String>,
    pub meta: Option<Meta>,
}

impl LogEvent {
    /// Whether this line marks the end of the deployment's log stream.
    pub fn is_terminal(&self) -> bool {
        if self.log_type == LogType::Success {
            return true;
        }
        let lowered = self.log.to_lowercase();
        COMPLETION_MARKERS.iter().any(|m| lowered.contains(m))
    }
}
