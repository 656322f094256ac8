use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use transaction_loader::{
    init_logging, ConfigOverrides, LoaderConfig, Pipeline, RunOutcome, RunSummary, SqliteGateway,
};

/// Load an XML transaction feed into SQLite
#[derive(Parser, Debug)]
#[command(name = "transaction-loader", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "LOADER_CONFIG")]
    config: Option<PathBuf>,

    /// XML feed to load
    #[arg(short, long, env = "LOADER_SOURCE")]
    source: Option<PathBuf>,

    /// SQLite database file
    #[arg(short, long, env = "LOADER_DATABASE")]
    database: Option<PathBuf>,

    /// Scan the whole feed for bad records before loading
    #[arg(long, env = "LOADER_VALIDATE")]
    validate: Option<bool>,

    #[arg(long, env = "LOADER_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Batches buffered before the reader waits
    #[arg(long, env = "LOADER_BATCH_CAPACITY")]
    batch_capacity: Option<usize>,

    /// Delivery attempts per batch before it is requeued
    #[arg(long, env = "LOADER_ATTEMPTS")]
    attempts: Option<usize>,

    /// Error events tolerated before the run is force-stopped
    #[arg(long, env = "LOADER_ERROR_THRESHOLD")]
    error_threshold: Option<usize>,

    /// Desired writer threads (clamped by available cores)
    #[arg(long, env = "LOADER_THREADS")]
    threads: Option<usize>,

    #[arg(long, env = "LOADER_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source_path: self.source.clone(),
            database_path: self.database.clone(),
            validate_first: self.validate,
            batch_size: self.batch_size,
            batch_capacity: self.batch_capacity,
            attempts: self.attempts,
            error_threshold: self.error_threshold,
            threads: self.threads,
            log_level: self.log_level.clone(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(summary) => match summary.outcome {
            RunOutcome::Delivered => ExitCode::SUCCESS,
            RunOutcome::ForcedStop => ExitCode::from(2),
        },
        Err(err) => {
            eprintln!("❌ {:#}", err);
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> Result<RunSummary> {
    let config = LoaderConfig::resolve(cli.config.as_deref(), cli.overrides())
        .context("Invalid configuration")?;
    init_logging(&config.log_level);

    println!("🗄️  Transaction Loader - XML → SQLite + WAL");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📂 Feed:     {}", config.source_path.display());
    println!("💾 Database: {}", config.database_path.display());

    let gateway = Arc::new(SqliteGateway::open(
        &config.database_path,
        config.gateway_timeout(),
    )?);

    let pipeline = Pipeline::new(config, gateway.clone());
    let summary = pipeline.run_configured()?;

    if let Err(err) = gateway.record_run(&summary) {
        eprintln!("⚠️  Could not record run: {:#}", err);
    }

    print_summary(&summary);
    if let Ok(counts) = gateway.counts() {
        println!(
            "✓ Database contains {} clients, {} places, {} transactions",
            counts.clients, counts.places, counts.transactions
        );
    }

    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Run {}", summary.run_id);
    println!("✓ Records read:         {}", summary.records_read);
    println!("✓ Transactions written: {}", summary.transactions_written);
    println!("✓ Batches requeued:     {}", summary.batches_requeued);
    println!("✓ Writers started:      {}", summary.writers_started);
    println!("✓ Error events:         {}", summary.errors);
    println!("✓ Elapsed:              {} ms", summary.elapsed_ms);

    match summary.outcome {
        RunOutcome::Delivered => {
            println!("🎉 All transactions delivered");
        }
        RunOutcome::ForcedStop => {
            println!("❌ Run force-stopped: not every transaction was stored");
            println!("   Run the loader again on the same feed. Records already");
            println!("   stored are matched by key and will not be duplicated.");
        }
    }
}
