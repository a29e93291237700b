//! Breakout governor - main entry point
//!
//! This binary provides two subcommands:
//! - replay: Drive the trading core over historical CSV bars with paper fills
//! - rebuild: Reconstruct rolling outcome windows from the audit store

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "breakout-governor")]
#[command(about = "Donchian/VWAP breakout core with expectancy ranking and portfolio risk governor", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay historical bars through the core
    Replay {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/breakout_1h.json")]
        config: String,

        /// Initial capital
        #[arg(long)]
        capital: Option<f64>,

        /// Outcome audit database (overrides config file)
        #[arg(long)]
        audit_db: Option<String>,
    },

    /// Rebuild rolling windows from the audit store and print statistics
    Rebuild {
        /// Outcome audit database
        #[arg(long, default_value = "outcomes.db")]
        audit_db: String,

        /// Expectancy mode (mean or median)
        #[arg(short, long, default_value = "mean")]
        mode: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // keep the console clean for the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

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
    }

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Replay { .. } => ("replay", true),
        Commands::Rebuild { .. } => ("rebuild", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Replay {
            config,
            capital,
            audit_db,
        } => commands::replay::run(config, capital, audit_db),

        Commands::Rebuild { audit_db, mode } => commands::rebuild::run(audit_db, mode),
    }
}
