use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use flowlogd::core::{format_timestamp, parse_timestamp};
use flowlogd::{
    AccountDescriptor, CoordinationPaths, CoordinationStore, CycleOutcome, FlowlogConfig,
    FlowlogNode, PeriodicScheduler, TaskOutcome,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "flowlogd")]
#[command(about = "Distributed flow-log collection and purge daemon")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, default_value = "/etc/flowlogd/flowlogd.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run both periodic cycles and the local worker pool until Ctrl-C.
    Run,
    /// Run one collect tick and wait for the dispatched work.
    CollectTick,
    /// Run one purge tick and wait for the dispatched work.
    PurgeTick,
    /// Collect one window for one account right now.
    CollectAccount {
        #[arg(long)]
        account_id: String,
        #[arg(long)]
        bucket: String,
        /// Window start as `dd-mm-YYYY HH:MM:SS`; defaults to the lookback window.
        #[arg(long)]
        start: Option<String>,
    },
    /// Print the global and per-account progress records.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = FlowlogConfig::from_json_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Command::Run => run(&config).await,
        Command::CollectTick => {
            let node = FlowlogNode::from_config(&config)?;
            let outcome = node.coordinator.run_collect_cycle().await;
            node.drain().await?;
            print_outcome("collect", outcome?);
            Ok(())
        }
        Command::PurgeTick => {
            let node = FlowlogNode::from_config(&config)?;
            let outcome = node.coordinator.run_purge_cycle().await;
            node.drain().await?;
            print_outcome("purge", outcome?);
            Ok(())
        }
        Command::CollectAccount {
            account_id,
            bucket,
            start,
        } => collect_account(&config, account_id, bucket, start).await,
        Command::Status => status(&config).await,
    }
}

async fn run(config: &FlowlogConfig) -> Result<()> {
    let node = FlowlogNode::from_config(config).context("failed to assemble node")?;
    info!(
        node = %config.node_identity,
        namespace = %config.namespace,
        "starting flowlogd"
    );
    let scheduler = PeriodicScheduler::spawn(
        node.coordinator.clone(),
        config.scheduler_tick_duration(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    scheduler.stop().await?;
    node.shutdown().await?;
    Ok(())
}

async fn collect_account(
    config: &FlowlogConfig,
    account_id: String,
    bucket: String,
    start: Option<String>,
) -> Result<()> {
    let start = match start {
        Some(raw) => Some(
            parse_timestamp(&raw).ok_or_else(|| anyhow!("invalid --start '{}'", raw))?,
        ),
        None => None,
    };
    let node = FlowlogNode::from_config(config)?;
    let account = AccountDescriptor::new(account_id, bucket);
    let outcome = node.worker.process_collection(&account, start).await;
    node.shutdown().await?;
    match outcome? {
        TaskOutcome::Collected { end_time } => {
            println!(
                "collected {} up to {}",
                account.account_id,
                format_timestamp(&end_time)
            );
        }
        TaskOutcome::Skipped => println!("{} is being collected by another node", account.account_id),
        TaskOutcome::Purged { .. } => {}
    }
    Ok(())
}

async fn status(config: &FlowlogConfig) -> Result<()> {
    let backend = std::sync::Arc::new(flowlogd::FsCoordinationBackend::new(
        config.coordination_root.clone(),
    ));
    let store = CoordinationStore::from_config(backend, config);
    let paths = CoordinationPaths::from_config(config);

    for (label, path) in [
        ("collect", paths.collect_trigger()),
        ("purge", paths.purge_trigger()),
    ] {
        print_record(label, &store, &path).await?;
    }
    for account_id in store.list_children(&paths.accounts_root()).await? {
        print_record(&account_id, &store, &paths.account(&account_id)).await?;
    }
    Ok(())
}

async fn print_record(label: &str, store: &CoordinationStore, path: &str) -> Result<()> {
    match store.get(path).await? {
        Some(record) => println!(
            "{:<24} next_start_time={:<20} updated_by={}",
            label,
            record
                .next_start_time
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string()),
            record.updated_by.as_deref().unwrap_or("-")
        ),
        None => println!("{:<24} (no record)", label),
    }
    Ok(())
}

fn print_outcome(cycle: &str, outcome: CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped => println!("{} cycle is running on another node", cycle),
        CycleOutcome::Gated { next_start_time } => println!(
            "{} cycle not due until {}",
            cycle,
            next_start_time
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string())
        ),
        CycleOutcome::NoAccounts => println!("no flow-log enabled accounts"),
        CycleOutcome::Completed {
            report,
            next_start_time,
        } => println!(
            "{} cycle: {} accounts, {} submitted, {} corrected ({} tasks), {} overflowed; next run {}",
            cycle,
            report.accounts,
            report.submitted,
            report.corrected,
            report.correction_tasks,
            report.overflowed,
            format_timestamp(&next_start_time)
        ),
    }
}
