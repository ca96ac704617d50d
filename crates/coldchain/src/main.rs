use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use coldchain_core::service::{Backends, IngestionService};
use coldchain_core::{db, logging, Config};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Cold-chain temperature ingestion daemon", long_about = None)]
struct Cli {
    /// Config file; defaults to $COLDCHAIN_CONFIG, then built-in defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler, collectors and batch writer until interrupted
    Run(RunArgs),
    /// Run database migrations
    Migrate,
    /// Validate the config and check that the database and queue answer
    CheckConfig,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Skip running migrations before starting
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init(&config.logging);

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Migrate => {
            let pool = db::connect(config.database_url()?, &config.database).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations applied");
            Ok(())
        }
        Command::CheckConfig => {
            let backends = Backends::from_config(&config).await?;
            let tenants = backends.check().await?;
            println!(
                "Configuration OK: {} backend queue '{}', {} active tenants",
                config.queue.backend.as_str(),
                config.queue.queue_name,
                tenants
            );
            Ok(())
        }
    }
}

async fn run(config: Config, args: RunArgs) -> Result<()> {
    let backends = Backends::from_config(&config).await?;
    if let Some(pool) = &backends.pool {
        if args.skip_migrations {
            warn!("Skipping migrations at user request");
        } else {
            db::run_migrations(pool).await?;
        }
    }

    let service = IngestionService::start(&config, backends).await?;
    shutdown_signal().await;

    let stats = service.shutdown().await;
    info!(
        rows = stats.rows_written,
        batches = stats.batches_flushed,
        dead_lettered = stats.dead_lettered,
        "Shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
