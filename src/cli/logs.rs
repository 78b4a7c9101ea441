use super::run::{build_store, load, RunError};
use crate::event::decode::parse_timestamp_str;
use crate::event::LogEvent;
use crate::storage::LogQuery;
use chrono::SecondsFormat;
use std::path::PathBuf;

/// `logpipe logs <deployment_id>`: print one page of a deployment's log.
pub async fn logs(
    config_path: Option<PathBuf>,
    deployment_id: String,
    after: Option<String>,
    limit: usize,
) -> Result<(), RunError> {
    let mut query = LogQuery::new(deployment_id).limit(limit);
    if let Some(after) = after {
        let ts = parse_timestamp_str(&after)
            .map_err(|e| RunError::InvalidArgument(format!("--after: {}", e)))?;
        query = query.after(ts);
    }

    let config = load(config_path.as_deref())?;
    let store = build_store(&config)?;
    let events = store.query_logs(&query).await?;

    for event in &events {
        println!("{}", format_event(event));
    }

    if events.len() == query.limit {
        if let Some(last) = events.last() {
            eprintln!(
                "More lines may follow; continue with --after {}",
                last.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
            );
        }
    }
    Ok(())
}

fn format_event(event: &LogEvent) -> String {
    let ts = event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut line = match &event.step {
        Some(step) => format!("{} {:<7} [{}] {}", ts, event.log_type, step, event.log),
        None => format!("{} {:<7} {}", ts, event.log_type, event.log),
    };
    if event.is_terminal() {
        line.push_str("  (deployment finished)");
    }
    line
}
