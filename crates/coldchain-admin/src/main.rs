use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use coldchain_core::service::{collect_once, Backends};
use coldchain_core::types::IngestionLogEntry;
use coldchain_core::writer::{DeadLetterReason, DeadLetterSink};
use coldchain_core::{logging, Config};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cold-chain ingestion administrative tooling", long_about = None)]
struct Cli {
    /// Config file; defaults to $COLDCHAIN_CONFIG, then built-in defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List active tenants and their collection settings
    Tenants,
    /// Show recent ingestion attempts
    Logs(LogsArgs),
    /// Inspect or replay dead-lettered readings
    #[command(subcommand)]
    DeadLetters(DeadLetterCommand),
    /// Run one collection for a tenant right now, outside the schedule
    CollectOnce(CollectOnceArgs),
}

#[derive(Args, Debug)]
struct LogsArgs {
    /// Only show attempts for this tenant code
    #[arg(long)]
    tenant: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[derive(Subcommand, Debug)]
enum DeadLetterCommand {
    /// Summarize dead-letter files waiting for replay
    List,
    /// Publish every dead-lettered event back onto the queue
    Replay,
}

#[derive(Args, Debug)]
struct CollectOnceArgs {
    /// Tenant code as stored in the registry
    tenant: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init(&config.logging);

    match cli.command {
        Command::Tenants => handle_tenants(&config).await,
        Command::Logs(args) => handle_logs(&config, args).await,
        Command::DeadLetters(DeadLetterCommand::List) => handle_dead_letter_list(&config),
        Command::DeadLetters(DeadLetterCommand::Replay) => handle_dead_letter_replay(&config).await,
        Command::CollectOnce(args) => handle_collect_once(&config, args).await,
    }
}

fn table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table
}

async fn handle_tenants(config: &Config) -> Result<()> {
    let backends = Backends::from_config(config).await?;
    let tenants = backends.registry.active_tenants().await?;

    let mut table = table();
    table.set_header(vec!["Code", "Method", "Interval (s)", "Source URL"]);
    for tenant in &tenants {
        table.add_row(vec![
            tenant.code.clone(),
            tenant.sharing_method.to_string(),
            tenant
                .polling_interval(config.scheduler.min_interval_secs)
                .as_secs()
                .to_string(),
            tenant.source_url.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    println!("{} active tenants", tenants.len());
    Ok(())
}

async fn handle_logs(config: &Config, args: LogsArgs) -> Result<()> {
    let backends = Backends::from_config(config).await?;
    let tenant_id = match &args.tenant {
        Some(code) => match backends.registry.tenant_by_code(code).await? {
            Some(tenant) => Some(tenant.id),
            None => bail!("no tenant with code '{code}'"),
        },
        None => None,
    };

    let entries = backends.logs.recent(tenant_id, args.limit).await?;
    if entries.is_empty() {
        println!("No ingestion attempts recorded.");
        return Ok(());
    }

    let mut table = table();
    table.set_header(vec![
        "Started", "Tenant", "Method", "Status", "OK", "Failed", "Duration", "Message",
    ]);
    for entry in &entries {
        table.add_row(log_row(entry));
    }
    println!("{table}");
    Ok(())
}

fn log_row(entry: &IngestionLogEntry) -> Vec<String> {
    let duration = entry
        .end_time
        .map(|end| format!("{:.1}s", (end - entry.start_time).num_milliseconds() as f64 / 1000.0))
        .unwrap_or_else(|| "-".to_string());
    vec![
        entry.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
        entry.tenant_id.to_string(),
        entry.method.clone(),
        entry.status.to_string(),
        entry.records_succeeded.to_string(),
        entry.records_failed.to_string(),
        duration,
        entry.error_message.clone().unwrap_or_default(),
    ]
}

fn handle_dead_letter_list(config: &Config) -> Result<()> {
    let sink = DeadLetterSink::new(&config.writer.dead_letter_dir);
    let files = sink.files()?;
    if files.is_empty() {
        println!("No dead letters in {}.", sink.dir().display());
        return Ok(());
    }

    let mut table = table();
    table.set_header(vec!["File", "Letters", "Unconvertible", "Write failed", "Tenants"]);
    let mut total = 0;
    for path in &files {
        let letters = DeadLetterSink::read_file(path)?;
        let unconvertible = letters
            .iter()
            .filter(|letter| letter.reason == DeadLetterReason::Unconvertible)
            .count();
        let mut tenants: Vec<String> = letters
            .iter()
            .filter_map(|letter| letter.tenant_id.map(|id| id.to_string()))
            .collect();
        tenants.sort();
        tenants.dedup();
        total += letters.len();
        table.add_row(vec![
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            letters.len().to_string(),
            unconvertible.to_string(),
            (letters.len() - unconvertible).to_string(),
            tenants.len().to_string(),
        ]);
    }
    println!("{table}");
    println!("{total} dead letters in {} files", files.len());
    Ok(())
}

async fn handle_dead_letter_replay(config: &Config) -> Result<()> {
    let backends = Backends::from_config(config).await?;
    let sink = DeadLetterSink::new(&config.writer.dead_letter_dir);
    let summary = sink.replay(backends.queue.as_ref()).await?;
    info!(files = summary.files, republished = summary.republished, "Replay finished");
    println!(
        "Republished {} events from {} files ({} skipped).",
        summary.republished, summary.files, summary.skipped
    );
    Ok(())
}

async fn handle_collect_once(config: &Config, args: CollectOnceArgs) -> Result<()> {
    let backends = Backends::from_config(config).await?;
    let entry = collect_once(config, &backends, &args.tenant).await?;

    let mut table = table();
    table.set_header(vec![
        "Started", "Tenant", "Method", "Status", "OK", "Failed", "Duration", "Message",
    ]);
    table.add_row(log_row(&entry));
    println!("{table}");
    if config.queue.backend == coldchain_core::config::QueueBackend::Memory {
        println!("Note: the in-memory queue is discarded on exit; nothing was persisted.");
    }
    Ok(())
}
