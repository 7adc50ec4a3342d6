//! tuspapeles2026 client bot CLI
//!
//! Runs the monitor until interrupted, or performs one-off maintenance commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tuspapeles_bot::{
    error::Result,
    models::Config,
    pipeline::{CycleOutcome, Scheduler, collect_status, orphaned_keys},
    storage::{self, MemoryStorage},
};

/// tuspapeles2026 appointment slot monitor
#[derive(Parser, Debug)]
#[command(
    name = "tuspapeles-bot",
    version,
    about = "Watches the tuspapeles2026 portal and notifies subscribers about new slots"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor every target until Ctrl-C or SIGTERM
    Run,

    /// Run a single cycle for every target and exit
    Once,

    /// Validate the configuration file
    Validate,

    /// Show stored snapshots per target
    Status,
}

/// Initialize logging; `RUST_LOG` overrides the configured level.
fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = Config::load(&cli.config);

    let level = if cli.verbose {
        "debug"
    } else {
        loaded
            .as_ref()
            .map(|c| c.logging.level.as_str())
            .unwrap_or("info")
    };
    init_logging(level);

    let config = loaded.inspect_err(|e| {
        log::error!("cannot load {}: {}", cli.config.display(), e);
    })?;
    log::info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Run => {
            let scheduler = Scheduler::from_config(&config)?;
            let shutdown = CancellationToken::new();

            let trigger = shutdown.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                log::info!("signal received, shutting down");
                trigger.cancel();
            });

            scheduler.run(shutdown).await;
        }

        Command::Once => {
            let mut scheduler = Scheduler::from_config(&config)?;
            let abort = CancellationToken::new();

            let trigger = abort.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                trigger.cancel();
            });

            for (name, outcome) in scheduler.run_once(&abort).await {
                match outcome {
                    CycleOutcome::Completed(summary) => log::info!(
                        "{}: {} slot(s), {} new, {} notified{}",
                        name,
                        summary.slots,
                        summary.appeared,
                        summary.sent,
                        if summary.baseline { " (baseline recorded)" } else { "" }
                    ),
                    CycleOutcome::Failed(e) => log::warn!("{}: {} ({})", name, e, e.kind()),
                    CycleOutcome::Cancelled => log::warn!("{}: cancelled", name),
                }
            }
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            // Building the scheduler also checks channel credentials.
            if let Err(e) = Scheduler::with_store(&config, Arc::new(MemoryStorage::new())) {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            for target in &config.targets {
                log::info!(
                    "✓ {} (key {}, {} recipient(s))",
                    target.describe(),
                    target.key(),
                    config.recipients_for(&target.name).len()
                );
            }
            log::info!("All validations passed!");
        }

        Command::Status => {
            config.validate()?;
            let store = storage::open(&config);
            for status in collect_status(&config, store.as_ref()).await? {
                match status.record {
                    Some(record) => log::info!(
                        "{} [{}]: {} slot(s), updated {}, {} pending",
                        status.name,
                        status.key,
                        record.snapshot.len(),
                        record.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        record.pending.len()
                    ),
                    None => log::info!("{} [{}]: no snapshot yet", status.name, status.key),
                }
            }
            for key in orphaned_keys(&config, store.as_ref()).await? {
                log::warn!("record {} belongs to no configured target", key);
            }
        }
    }

    Ok(())
}
