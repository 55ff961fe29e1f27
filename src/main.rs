//! RSI tier bot - main entry point
//!
//! This binary provides three subcommands:
//! - run: One trading pass over every configured asset (schedule with cron)
//! - status: Print the persisted state of each asset
//! - check-config: Validate the configuration file

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "rsi-tier-bot")]
#[command(about = "RSI oversold-recovery entries with tiered take-profit exits", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "configs/bot.json")]
    config: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one trading pass
    Run {
        /// Only process this product (e.g. "BTC-USD")
        #[arg(short, long)]
        asset: Option<String>,
    },

    /// Show persisted trade state
    Status,

    /// Validate the configuration file
    CheckConfig,
}

/// Log directory from the config file, falling back to `logs` when the
/// config cannot be read yet (the command reports that error itself)
fn log_dir_for(config_path: &str) -> PathBuf {
    rsi_tier_bot::Config::from_file(config_path)
        .map(|c| c.bot.log_dir)
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

fn setup_logging(verbose: bool, command_name: &str, log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(&log_filename);

    // Filter out noisy HTTP crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never(log_dir, &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // Same format, no ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    // Credentials may live in .env; a missing file is fine
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Status => "status",
        Commands::CheckConfig => "check_config",
    };

    setup_logging(cli.verbose, command_name, &log_dir_for(&cli.config))?;

    match cli.command {
        Commands::Run { asset } => commands::run::run(&cli.config, asset),
        Commands::Status => commands::status::run(&cli.config),
        Commands::CheckConfig => commands::check_config::run(&cli.config),
    }
}
