//! snapcache - build cache and snapshot ref manager
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use snapcache::cli::{Cli, Commands};
use snapcache::config::ConfigManager;
use snapcache::error::CacheResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CacheResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug; general.verbose bumps the floor to info
    let level = cli.verbose.max(u8::from(config.general.verbose));
    let filter = match level {
        0 => EnvFilter::new("snapcache=warn"),
        1 => EnvFilter::new("snapcache=info"),
        _ => EnvFilter::new("snapcache=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
    debug!("Loaded config from {}", config_manager.path().display());

    match cli.command {
        Commands::Du(args) => snapcache::cli::commands::du(args, &config).await,
        Commands::Prune(args) => snapcache::cli::commands::prune(args, &config).await,
        Commands::Config(args) => {
            snapcache::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
