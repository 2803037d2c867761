//! Status command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::warn;

use crate::commands::{feed_cache, load_config};
use crate::enforcer::create_backend;
use crate::signal::ShutdownToken;
use crate::utils::format_count;

/// Run the status command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let backend = create_backend(&config, ShutdownToken::new())?;

    let is_active = backend.is_active().await?;
    println!();
    println!("autoban: {}", if is_active { "ENABLED" } else { "DISABLED" });
    println!("Backend: {}", backend.name());
    println!("Verdict: {:?}", config.verdict);
    println!("Sync interval: {}", config.sync_interval);

    if is_active {
        println!("Set members: {}", member_count_line(backend.entry_count().await));
        if let Ok(stats) = backend.stats().await {
            println!(
                "Blocked: {} packets, {} bytes",
                format_count(stats.packets_blocked as usize),
                format_count(stats.bytes_blocked as usize)
            );
        }
    }

    println!();
    println!("Sources:");
    println!("  static entries: {}", config.sources.entries.len());
    for file in &config.sources.files {
        let state = if file.exists() { "" } else { " (missing)" };
        println!("  file: {}{}", file.display(), state);
    }
    match feed_cache(&config, false) {
        Some(cache) => {
            let snapshot = cache.snapshot();
            let when = snapshot
                .fetched_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  feed: {} urls, {} cached entries, last refresh {}",
                config.feed.urls.len(),
                format_count(snapshot.len()),
                when
            );
        }
        None => println!("  feed: disabled"),
    }
    println!();
    Ok(())
}

/// A failed count is reported as such, never as an empty set.
fn member_count_line(count: Result<usize>) -> String {
    match count {
        Ok(n) => format_count(n),
        Err(e) => {
            warn!("Failed to count set members: {:#}", e);
            format!("unknown ({:#})", e)
        }
    }
}
