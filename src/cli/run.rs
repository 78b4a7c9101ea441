use crate::config::parse::{load_config, ConfigError};
use crate::config::resolve_config_path;
use crate::config::types::{Config, StoreBackend};
use crate::pipeline::{Member, PipelineError, PipelineReport, PipelineSettings};
use crate::source::{ConsumerGroup, KafkaGroup, SourceError};
use crate::storage::{schema, ClickHouseStore, DuckDbStore, LogStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Load the config file if one is found, otherwise assemble it from the
/// environment.
pub fn load(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    match resolve_config_path(config_path) {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            load_config(&path)
        }
        None => {
            info!("No config file found, reading configuration from environment");
            Config::from_env()
        }
    }
}

/// Construct the configured store. Clients are built here once and handed
/// to every consumer.
pub fn build_store(config: &Config) -> Result<Arc<dyn LogStore>, StoreError> {
    let table = &config.store.table;
    match config.store.backend {
        StoreBackend::DuckDb => {
            let duckdb = config.store.duckdb.as_ref().ok_or_else(|| {
                StoreError::Unavailable("store.duckdb section is missing".to_string())
            })?;
            info!(path = %duckdb.path.display(), "Initializing DuckDB store");
            Ok(Arc::new(DuckDbStore::new(&duckdb.path, table)?))
        }
        StoreBackend::ClickHouse => {
            let clickhouse = config.store.clickhouse.as_ref().ok_or_else(|| {
                StoreError::Unavailable("store.clickhouse section is missing".to_string())
            })?;
            info!(url = %clickhouse.url, database = %clickhouse.database, "Initializing ClickHouse store");
            Ok(Arc::new(ClickHouseStore::new(
                clickhouse,
                table,
                config.store.write_timeout,
            )?))
        }
    }
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config = load(config_path.as_deref())?;
    let store = build_store(&config)?;
    schema::prepare(store.as_ref()).await?;

    // Every member must reach the brokers before anything is consumed
    let mut groups: Vec<Box<dyn ConsumerGroup>> = Vec::with_capacity(config.pipeline.consumers);
    for member in 0..config.pipeline.consumers {
        groups.push(Box::new(KafkaGroup::connect(&config.source, member).await?));
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signals = tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
        }
        signal_cancel.cancel();
    });

    let settings = PipelineSettings::from_config(&config);
    let result = run_pipelines(groups, store, settings, cancel).await;
    signals.abort();

    let reports = result?;
    let written: u64 = reports.iter().map(|r| r.metrics.events_written).sum();
    let discarded: u64 = reports.iter().map(|r| r.metrics.discarded).sum();
    info!(
        pipelines = reports.len(),
        events_written = written,
        discarded = discarded,
        "Ingestion shutdown complete"
    );
    Ok(())
}

/// Run one member per consumer group handle until `cancel` fires or one of
/// them fails. Each member runs a pipeline per assigned partition. A failure
/// cancels the rest so they drain before the error is returned.
pub async fn run_pipelines(
    groups: Vec<Box<dyn ConsumerGroup>>,
    store: Arc<dyn LogStore>,
    settings: PipelineSettings,
    cancel: CancellationToken,
) -> Result<Vec<PipelineReport>, RunError> {
    let mut handles = Vec::with_capacity(groups.len());
    for (index, group) in groups.into_iter().enumerate() {
        let member = Member::new(
            format!("consumer-{}", index),
            group,
            Arc::clone(&store),
            settings.clone(),
            cancel.child_token(),
        );
        let on_failure = cancel.clone();
        handles.push(tokio::spawn(async move {
            let result = member.run().await;
            if result.is_err() {
                on_failure.cancel();
            }
            result
        }));
    }
    info!(consumers = handles.len(), "Ingestion started, press Ctrl+C to shutdown");

    let mut reports = Vec::new();
    let mut first_error = None;
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(Ok(member_reports)) => reports.extend(member_reports),
            Ok(Err(e)) => {
                first_error.get_or_insert(RunError::Pipeline(e));
            }
            Err(e) => {
                warn!(error = %e, "Pipeline task did not complete");
                first_error.get_or_insert(RunError::Join(e));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// `logpipe schema`: create the table and exit.
pub async fn schema(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config = load(config_path.as_deref())?;
    let store = build_store(&config)?;
    schema::prepare(store.as_ref()).await?;
    println!("Table {} is ready", config.store.table);
    Ok(())
}
