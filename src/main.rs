use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logpipe")]
#[command(about = "Deployment log ingestion from Kafka into a columnar store", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the log topic and write batches to the store
    Run,
    /// Create the log table if it does not exist
    Schema,
    /// Print stored log lines of one deployment
    Logs {
        deployment_id: String,
        /// Only lines strictly after this timestamp
        #[arg(long)]
        after: Option<String>,
        #[arg(long, default_value_t = logpipe::storage::DEFAULT_QUERY_LIMIT)]
        limit: usize,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logpipe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run) | None => {
            logpipe::cli::run::run(cli.config).await?;
        }
        Some(Commands::Schema) => {
            logpipe::cli::run::schema(cli.config).await?;
        }
        Some(Commands::Logs {
            deployment_id,
            after,
            limit,
        }) => {
            logpipe::cli::logs::logs(cli.config, deployment_id, after, limit).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                logpipe::cli::config::init(stdout)?;
            }
        },
    }

    Ok(())
}
