use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coc_tracker::config::{self, Config, LogFormat, LogOutput, LoggingConfig};
use coc_tracker::storage::{run_migrations, JobStore};
use coc_tracker::tracker::keys::{self, KeyPool};
use coc_tracker::tracker::Tracker;

#[derive(Parser)]
#[command(
    name = "coc-tracker",
    version,
    about = "Durable job scheduler tracking the Clash of Clans API",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file; environment variables are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides LOG_HANDLE
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracker until SIGINT or SIGTERM
    Run,

    /// Apply pending database migrations and exit
    Migrate,

    /// Load the key file and report how many keys it holds
    CheckKeys,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => {
            config::load_dotenv()?;
            Config::from_env()?
        }
    };

    let mut logging = config.logging.clone();
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    setup_tracing(&logging, cli.verbose)?;

    config.validate()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "coc-tracker starting");

    match cli.command {
        Commands::Run => {
            let tracker = Tracker::new(config).await?;
            if let Err(e) = tracker.run().await {
                tracing::error!(
                    error = %e,
                    category = %e.category(),
                    recoverable = e.is_recoverable(),
                    "Tracker stopped with an error"
                );
                return Err(e.into());
            }
        }

        Commands::Migrate => {
            migrate(&config).await?;
        }

        Commands::CheckKeys => {
            check_keys(&config).await?;
        }
    }

    tracing::info!("coc-tracker stopped");
    Ok(())
}

fn setup_tracing(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("coc_tracker=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("coc_tracker={},warn", logging.level))
            .with_context(|| format!("Invalid log level: {}", logging.level))?
    };

    let writer = match &logging.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Off => BoxMakeWriter::new(std::io::sink),
        LogOutput::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
    };

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer))
                .init();
        }
    }

    Ok(())
}

async fn migrate(config: &Config) -> Result<()> {
    let store = JobStore::new(&config.database).context("Failed to build database pool")?;
    store.ping().await.context("Failed to connect to database")?;

    let applied = run_migrations(&store, &config.database.migrations_dir)
        .await
        .context("Failed to apply migrations")?;

    if applied.is_empty() {
        println!("Database is up to date.");
    } else {
        println!("Applied {} migration(s): {:?}", applied.len(), applied);
    }

    store.close();
    Ok(())
}

async fn check_keys(config: &Config) -> Result<()> {
    let quota = keys::quota(config.keys.rate_per_second, config.keys.burst)
        .context("Key rate and burst must be greater than 0")?;

    let pool = KeyPool::load_from_file(&config.keys.file, quota)
        .await
        .with_context(|| format!("Failed to load keys from {}", config.keys.file.display()))?;

    println!("Loaded {} key(s) from {}", pool.len(), config.keys.file.display());
    for usage in pool.usage() {
        println!("  {}", usage.key);
    }

    Ok(())
}
