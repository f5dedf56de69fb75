//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// snapcache - build cache and snapshot ref manager
///
/// Inspects and reclaims the records of a local snapcache store.
#[derive(Parser, Debug)]
#[command(name = "snapcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "SNAPCACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show disk usage per cache record
    Du(DuArgs),

    /// Remove unused cache records
    Prune(PruneArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the du command
#[derive(Parser, Debug)]
pub struct DuArgs {
    /// Only show records matching a filter (id==X, id~=PREFIX, type==T)
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the prune command
#[derive(Parser, Debug)]
pub struct PruneArgs {
    /// Include internal records
    #[arg(short, long)]
    pub all: bool,

    /// Only prune records matching a filter (id==X, id~=PREFIX, type==T)
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Keep records used within the last N seconds (default: from config)
    #[arg(long)]
    pub keep_duration: Option<u64>,

    /// Keep unused records up to N bytes in total (default: from config)
    #[arg(long)]
    pub keep_bytes: Option<u64>,

    /// Dry run - show what would be removed
    #[arg(long)]
    pub dry_run: bool,

    /// Output format for the removed records
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for record listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one id per line)
    Plain,
}
