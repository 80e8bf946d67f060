//! Trade Replicator
//!
//! Mirrors a master trading account onto slave accounts, scaling each copy
//! to the slave's balance, and flattens everything when the master breaches
//! its daily drawdown limit.

mod broker;
mod config;
mod dashboard;
mod db;
mod models;
mod trading;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::broker::{BrokerSession, HttpGateway, RetryPolicy};
use crate::config::{AppConfig, DEFAULT_CONFIG_FILE};
use crate::db::{Database, DEFAULT_JOURNAL_URL};
use crate::trading::{flatten_accounts, CopierEngine};

/// Master/slave trade replicator CLI.
#[derive(Parser)]
#[command(name = "replicator")]
#[command(about = "Copy trades from a master account to scaled slave accounts", long_about = None)]
struct Cli {
    /// Account configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Replication journal database
    #[arg(short, long, env = "REPLICATOR_JOURNAL", default_value = DEFAULT_JOURNAL_URL)]
    journal: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the copier engine and the console dashboard
    Run {
        /// Dashboard refresh period in seconds
        #[arg(short, long, default_value = "2")]
        refresh: u64,

        /// Run without the replication journal
        #[arg(long)]
        no_journal: bool,
    },

    /// Write a configuration template
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Show journal statistics and recent risk events
    Status,

    /// Close every position on the master and all slaves, then exit
    CloseAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging; stdout belongs to the dashboard
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => {
            if AppConfig::write_template(&cli.config, force)? {
                println!("Template written to {}. Fill in the accounts and run again.", cli.config.display());
            } else {
                println!("{} already exists. Use --force to overwrite.", cli.config.display());
            }
        }

        Commands::Config => {
            let Some(config) = load_or_bootstrap(&cli.config)? else {
                return Ok(());
            };
            let policy = &config.policy;

            println!("\n=== Accounts ===\n");
            println!("Master:   {} @ {} (password ***)", config.master.login, config.master.server);
            for slave in &config.slaves {
                println!("Slave:    {} @ {} (password ***)", slave.login, slave.server);
            }
            println!("Bridge:   {}", config.bridge_url);

            println!("\n=== Policy ===\n");
            println!("Risk:");
            println!("  Daily Drawdown Limit: {}%", policy.drawdown_threshold * rust_decimal::Decimal::ONE_HUNDRED);
            println!("  Flatten Cooldown:     {}ms", policy.flatten_cooldown_ms);

            println!("\nSizing:");
            println!("  Min Lot:              {}", policy.min_lot);
            println!("  Scale Factor:         slave balance / master balance (slaves below master skipped)");

            println!("\nExecution:");
            println!("  Retry Attempts:       {}", policy.retry_attempts);
            println!("  Retry Delay:          {}ms", policy.retry_delay_ms);
            println!("  Poll Interval:        {}ms", policy.poll_interval_ms);
            println!("  Order Deviation:      {} points", policy.order_deviation);
            println!("  Order Magic:          {}", policy.order_magic);
        }

        Commands::Status => {
            let db = Database::new(&cli.journal).await?;
            let stats = db.replication_stats().await?;
            let mirrors = db.open_mirrors().await?;
            let events = db.recent_risk_events(10).await?;

            println!("\n=== Replications ===");
            println!("Total:            {}", stats.total);
            println!("Open Mirrors:     {}", stats.open);
            println!("Closed:           {}", stats.closed);
            println!("Flattened:        {}", stats.flattened);
            println!("Failed:           {}", stats.failed);

            println!("\n=== Open Mirrors ===");
            if mirrors.is_empty() {
                println!("  (none)");
            }
            for mirror in &mirrors {
                println!(
                    "  master {:<10} slave {:<10} {:<10} {:<10} {:>8.2} since {}",
                    mirror.master_ticket().to_string(),
                    mirror.slave_login(),
                    mirror.slave_ticket().to_string(),
                    mirror.symbol,
                    mirror.volume,
                    mirror.created_at
                );
            }

            println!("\n=== Recent Risk Events ===");
            if events.is_empty() {
                println!("  (none)");
            }
            for event in &events {
                println!(
                    "  #{:<5} {} {:<18} equity {:.2} baseline {:.2} drawdown {:.2}%",
                    event.id,
                    event.occurred_at,
                    event.kind,
                    event.equity,
                    event.baseline,
                    event.drawdown * 100.0
                );
            }
        }

        Commands::CloseAll => {
            let Some(config) = load_or_bootstrap(&cli.config)? else {
                return Ok(());
            };
            let gateway = HttpGateway::new(&config.bridge_url)?;
            let session = BrokerSession::new(gateway, RetryPolicy::from_config(&config.policy));

            let report = flatten_accounts(&session, &config.master_account(), &config.slave_accounts()).await;
            match Database::new(&cli.journal).await {
                Ok(db) => {
                    if let Err(e) = db.mark_all_flattened().await {
                        warn!(error = %e, "Failed to update journal");
                    }
                }
                Err(e) => warn!(error = %e, "Journal unavailable"),
            }

            println!("Closed:      {}", report.closed);
            println!("Failed:      {}", report.failed);
            if !report.unreachable.is_empty() {
                println!("Unreachable: {:?}", report.unreachable);
            }
        }

        Commands::Run { refresh, no_journal } => {
            let Some(config) = load_or_bootstrap(&cli.config)? else {
                return Ok(());
            };

            info!(
                master = config.master.login,
                slaves = config.slaves.len(),
                bridge = %config.bridge_url,
                "Starting trade replicator"
            );

            let journal = if no_journal {
                None
            } else {
                Some(Database::new(&cli.journal).await.context("Failed to open journal")?)
            };

            // Engine and dashboard each get their own bridge connection
            let engine_gateway = HttpGateway::new(&config.bridge_url)?;
            let control_gateway = HttpGateway::new(&config.bridge_url)?;

            let mut engine = CopierEngine::new(
                config.policy.clone(),
                config.master_account(),
                config.slave_accounts(),
                engine_gateway,
                journal,
            );
            engine.initialize(Utc::now().date_naive()).await?;

            let control = engine.control_surface(control_gateway);
            let shutdown = engine.shutdown_signal();

            let engine_task = tokio::spawn(async move {
                if let Err(e) = engine.run().await {
                    error!(error = %e, "Copier engine error");
                }
            });

            println!("\n=== Trade Replicator ===");
            println!("Master: {}", config.master.login);
            println!("Slaves: {}", config.slaves.len());
            println!("Press Ctrl+C or type 'quit' to stop.\n");

            dashboard::run(control, Duration::from_secs(refresh.max(1)), shutdown.clone()).await?;

            shutdown.store(true, Ordering::SeqCst);
            if let Err(e) = engine_task.await {
                error!(error = %e, "Copier engine task failed");
            }
            info!("Trade replicator stopped");
        }
    }

    Ok(())
}

/// Load the configuration, writing a template and returning `None` on first run.
fn load_or_bootstrap(path: &Path) -> Result<Option<AppConfig>> {
    if !path.exists() {
        AppConfig::write_template(path, false)?;
        println!(
            "No configuration found. A template was written to {}; fill in the accounts and run again.",
            path.display()
        );
        return Ok(None);
    }
    AppConfig::load(path).map(Some)
}
