use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use extdrive::cli::{commands, tui};
use extdrive::logging::{self, LogConfig, LogTarget};
use extdrive::{adapters, config, context};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "extdrive")]
#[command(about = "Inspect, unmount and image removable drives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file to use instead of the per-user one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive drive browser (default)
    Tui,
    /// Print the detected external drives
    List {
        #[arg(long)]
        json: bool,
    },
    /// Flush writes and unmount every partition of a drive
    Unmount {
        /// Kernel name of the drive, e.g. /dev/sdb
        device: String,
    },
    /// Copy a drive or partition to an image file
    Clone {
        /// Kernel name of a drive or partition
        target: String,
        /// Image path; defaults to a timestamped file in the backup directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Copy block size in bytes
        #[arg(long)]
        block_size: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

/// Command line values layered over the config files.
#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    backup_directory: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Tui);

    let config = config::AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;

    let target = match (&command, &config.log_file) {
        (_, Some(path)) => LogTarget::File(path.clone()),
        (Commands::Tui, None) => LogTarget::Discard,
        _ => LogTarget::Stderr,
    };
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
        target,
    })?;

    let (runner, prober) = adapters::get_backends(&config);
    let ctx = context::AppContext::new(config, runner, prober);

    match command {
        Commands::Tui => tui::run(ctx).await.context("Terminal UI failed")?,
        Commands::List { json } => commands::run_list(&ctx, json).await?,
        Commands::Unmount { device } => commands::run_unmount(&ctx, &device).await?,
        Commands::Clone {
            target,
            output,
            block_size,
        } => commands::run_clone(&ctx, &target, output, block_size).await?,
        Commands::Config => commands::print_config(&ctx)?,
    }

    Ok(())
}
