//! Prune command - reclaim unused records

use super::output::{format_bytes, print_records};
use crate::cache::Manager;
use crate::cli::args::{OutputFormat, PruneArgs};
use crate::config::{Config, ConfigManager};
use crate::error::CacheResult;
use console::style;
use std::time::Duration;
use tokio::sync::mpsc;

/// Execute the prune command
pub async fn execute(args: PruneArgs, config: &Config) -> CacheResult<()> {
    let mut opts = config.gc.prune_info();
    opts.all |= args.all;
    opts.filters = args.filters;
    opts.dry_run = args.dry_run;
    if let Some(secs) = args.keep_duration {
        opts.keep_duration = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(bytes) = args.keep_bytes {
        opts.keep_bytes = bytes;
    }

    ConfigManager::ensure_state_dirs(&config.store.root).await?;
    let manager = Manager::open_local(&config.store).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = manager.prune(Some(&tx), opts).await;
    drop(tx);
    manager.close().await?;
    result?;

    let mut removed = vec![];
    while let Some(usage) = rx.recv().await {
        removed.push(usage);
    }

    match args.format {
        OutputFormat::Json | OutputFormat::Plain => print_records(&removed, args.format),
        OutputFormat::Table => {
            if removed.is_empty() {
                println!("Nothing to prune.");
                return Ok(());
            }
            let verb = if args.dry_run { "Would remove" } else { "Removed" };
            for r in &removed {
                println!("  {} {} ({})", style("•").red(), r.id, format_bytes(r.size));
            }
            let total: u64 = removed.iter().map(|r| r.size).sum();
            println!();
            println!(
                "{} {} {} record(s), {}",
                style("✓").green(),
                verb,
                removed.len(),
                format_bytes(total)
            );
            Ok(())
        }
    }
}
