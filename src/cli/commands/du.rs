//! Du command - report disk usage per record

use super::output::print_records;
use crate::cache::Manager;
use crate::cli::args::{DuArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::CacheResult;
use tracing::debug;

/// Execute the du command
pub async fn execute(args: DuArgs, config: &Config) -> CacheResult<()> {
    ConfigManager::ensure_state_dirs(&config.store.root).await?;
    let manager = Manager::open_local(&config.store).await?;

    let records = manager.disk_usage(&args.filters).await;
    manager.close().await?;
    let records = records?;
    debug!("Disk usage reported {} records", records.len());

    if records.is_empty() && !matches!(args.format, OutputFormat::Json) {
        println!("No cache records found.");
        return Ok(());
    }
    print_records(&records, args.format)
}
