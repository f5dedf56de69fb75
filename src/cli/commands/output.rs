//! Rendering of usage records

use crate::cache::UsageInfo;
use crate::cli::args::OutputFormat;
use crate::error::CacheResult;
use console::style;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn print_records(records: &[UsageInfo], format: OutputFormat) -> CacheResult<()> {
    match format {
        OutputFormat::Table => print_table(records),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Plain => {
            for r in records {
                println!("{}", r.id);
            }
        }
    }
    Ok(())
}

fn print_table(records: &[UsageInfo]) {
    println!(
        "{:<28} {:<8} {:<10} {:<16} {:<18} {}",
        "ID", "STATE", "SIZE", "TYPE", "LAST USED", "DESCRIPTION"
    );
    println!("{}", "-".repeat(96));

    for r in records {
        let state = if r.in_use {
            style("in-use").yellow().to_string()
        } else if r.mutable {
            style("mutable").cyan().to_string()
        } else {
            style("idle").dim().to_string()
        };
        let size = if r.shared {
            format!("{}*", format_bytes(r.size))
        } else {
            format_bytes(r.size)
        };
        let last_used = r
            .last_used_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<28} {:<8} {:<10} {:<16} {:<18} {}",
            r.id, state, size, r.record_type, last_used, r.description
        );
    }

    let (reclaimable, in_use) = totals(records);
    println!();
    println!(
        "Total: {} record(s), {} reclaimable, {} in use",
        records.len(),
        format_bytes(reclaimable),
        format_bytes(in_use)
    );
}

/// Bytes held by idle and in-use records; shared snapshots count once
fn totals(records: &[UsageInfo]) -> (u64, u64) {
    records.iter().fold((0, 0), |(idle, busy), r| {
        if r.in_use {
            (idle, busy + r.size)
        } else if r.shared {
            (idle, busy)
        } else {
            (idle + r.size, busy)
        }
    })
}
